//! Tree visualization for loop nests.

use std::borrow::Cow;
use std::io;
use std::sync::Arc;

use arbor_dag::FunctionDag;
use itertools::Itertools;
use ptree::{Style, TreeItem};

use super::{GpuRole, LoopNest};

/// Renders every loop level with its sizes, GPU role and the funcs stored
/// or inlined there.
#[derive(Clone)]
pub struct LoopNestTree<'a> {
    nest: Arc<LoopNest>,
    dag: &'a FunctionDag,
}

impl<'a> LoopNestTree<'a> {
    pub fn new(nest: &Arc<LoopNest>, dag: &'a FunctionDag) -> Self {
        Self { nest: nest.clone(), dag }
    }
}

impl TreeItem for LoopNestTree<'_> {
    type Child = Self;

    fn write_self<W: io::Write>(&self, f: &mut W, _style: &Style) -> io::Result<()> {
        write!(f, "{}", format_loop(&self.nest, self.dag))
    }

    fn children(&self) -> Cow<'_, [Self::Child]> {
        Cow::Owned(self.nest.children.iter().map(|c| LoopNestTree { nest: c.clone(), dag: self.dag }).collect())
    }
}

/// Format one loop level.
///
/// Output format: `stage [size...] role [flags] store: a, b inlined: c*3`
fn format_loop(nest: &LoopNest, dag: &FunctionDag) -> String {
    let mut out = match nest.stage {
        None => "root".to_string(),
        Some(s) => format!("{} [{}]", dag.stage(s).name, nest.size.iter().join(", ")),
    };
    if nest.gpu_role != GpuRole::None {
        out.push_str(&format!(" {}", nest.gpu_role));
    }
    if nest.innermost {
        out.push_str(" innermost");
    }
    if nest.parallel {
        out.push_str(" parallel");
    }
    if let Some(v) = nest.vectorized_loop_index {
        out.push_str(&format!(" vec={v}"));
    }
    if !nest.store_at.is_empty() {
        out.push_str(&format!(" store: {}", nest.store_at.iter().map(|n| &dag.node(*n).name).join(", ")));
    }
    if !nest.inlined.is_empty() {
        let inlined = nest.inlined.iter().map(|(n, c)| format!("{}*{c}", dag.node(*n).name)).join(", ");
        out.push_str(&format!(" inlined: {inlined}"));
    }
    out
}

/// Render a tree into a string.
pub fn render(nest: &LoopNest, dag: &FunctionDag) -> String {
    let mut buf = Vec::new();
    let tree = LoopNestTree { nest: Arc::new(nest.clone()), dag };
    match ptree::write_tree(&tree, &mut buf) {
        Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => format!("<failed to render loop nest: {e}>"),
    }
}

#[cfg(test)]
mod tests {
    use crate::test::helpers::*;

    use super::*;

    #[test]
    fn test_render_lists_stages_and_roles() {
        let h = Harness::pointwise_1d(1024);
        let ctx = h.ctx();
        let mut root = LoopNest::root();
        root.compute_here(h.node("out"), true, 0, false, &ctx);
        root.store_at.insert(h.node("out"));
        let text = render(&root, h.dag());
        assert!(text.starts_with("root store: out"));
        assert!(text.contains("out [256]"));
        assert!(text.contains("out [4] simd innermost vec=0"));
    }
}
