//! Rendering a materialized schedule as source.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use arbor_dag::{FunctionDag, StageMap};

use super::{StageScheduleState, StagedProducer};

/// The program reproducing a schedule: func handles, variable declarations,
/// one directive chain per stage, then the staged producers.
pub struct ScheduleSource<'a> {
    pub dag: &'a FunctionDag,
    pub stages: &'a StageMap<StageScheduleState>,
    pub new_serial_vars: &'a BTreeSet<String>,
    pub staged: &'a [StagedProducer],
}

impl fmt::Display for ScheduleSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "auto pipeline = get_pipeline();")?;
        for n in self.dag.nodes().iter().filter(|n| !n.is_input) {
            writeln!(f, "Func {} = pipeline.get_func({});", n.name, self.dag.realization_index(n.id))?;
        }

        // First accessor seen wins.
        let mut vars: BTreeMap<&str, &str> = BTreeMap::new();
        let mut rvars: BTreeMap<&str, &str> = BTreeMap::new();
        for v in self.stages.values().flat_map(|s| &s.vars).filter(|v| v.exists) {
            let decls = if v.is_rvar { &mut rvars } else { &mut vars };
            decls.entry(v.var.as_str()).or_insert(v.accessor.as_str());
        }
        for (kind, decls) in [("Var", &vars), ("RVar", &rvars)] {
            for (name, accessor) in decls {
                if accessor.is_empty() {
                    writeln!(f, "{kind} {name}(\"{name}\");")?;
                } else {
                    writeln!(f, "{kind} {name}({accessor});")?;
                }
            }
        }
        for v in self.new_serial_vars {
            writeln!(f, "Var {v}(\"{v}\");")?;
        }

        for (s, state) in self.stages {
            write!(f, "{}", self.dag.stage(*s).name)?;
            for d in &state.directives {
                write!(f, "\n    {d}")?;
            }
            writeln!(f, ";")?;
        }

        for p in self.staged {
            write!(f, "{}.in({})", self.dag.node(p.producer).name, self.dag.node(p.consumer).name)?;
            for d in &p.directives {
                write!(f, "\n    {d}")?;
            }
            writeln!(f, ";")?;
        }
        Ok(())
    }
}

/// Replace `$` with `_` everywhere outside double-quoted literals.
pub fn sanitize_names(source: &str) -> String {
    let mut in_quotes = false;
    source
        .chars()
        .map(|c| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            if c == '$' && !in_quotes { '_' } else { c }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("x$1", "x_1"; "bare")]
    #[test_case("Var x$1(\"x$1\");", "Var x_1(\"x$1\");"; "quoted kept")]
    #[test_case("no markers", "no markers"; "unchanged")]
    #[test_case("\"a$\" b$ \"c$\"", "\"a$\" b_ \"c$\""; "alternating quotes")]
    fn test_sanitize_names(input: &str, expected: &str) {
        assert_eq!(sanitize_names(input), expected);
    }
}
