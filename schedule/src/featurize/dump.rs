//! Binary feature dump consumed by cost-model training.
//!
//! One record per stage of every non-input func, funcs in dag order and
//! stages last to first. A record is the schedule features followed by the
//! pipeline features, each value a little-endian `f32`. There is no header:
//! readers know both vector lengths.

use std::io::Write;

use arbor_dag::{FunctionDag, Stage, StageMap};
use snafu::ResultExt;

use super::ScheduleFeatures;
use crate::error::*;

/// Write records whose schedule part comes from `schedule_features`.
pub fn write_feature_dump<W, F>(out: &mut W, dag: &FunctionDag, mut schedule_features: F) -> Result<()>
where
    W: Write,
    F: FnMut(&Stage) -> Vec<f64>,
{
    for node in dag.nodes().iter().filter(|n| !n.is_input) {
        for &s in node.stages.iter().rev() {
            let stage = dag.stage(s);
            write_values(out, &schedule_features(stage))?;
            write_values(out, stage.features.as_slice())?;
        }
    }
    out.flush().context(FeatureDumpSnafu)
}

/// Dump a featurization. Stages absent from `features` get default features.
pub fn save_featurization<W: Write>(
    out: &mut W,
    dag: &FunctionDag,
    features: &StageMap<ScheduleFeatures>,
) -> Result<()> {
    write_feature_dump(out, dag, |stage| features.get(&stage.id).copied().unwrap_or_default().values().to_vec())
}

fn write_values<W: Write>(out: &mut W, values: &[f64]) -> Result<()> {
    for &v in values {
        out.write_all(&(v as f32).to_le_bytes()).context(FeatureDumpSnafu)?;
    }
    Ok(())
}
