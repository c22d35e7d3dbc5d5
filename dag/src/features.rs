//! Static per-stage features.
//!
//! The scheduling core treats these as an opaque vector appended after the
//! schedule-derived features of every stage record.

/// Static features of one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineFeatures {
    values: Vec<f64>,
}

impl PipelineFeatures {
    /// Number of entries in the vector derived by [`PipelineFeatures::derived`].
    pub const DERIVED_LEN: usize = 6;

    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Default vector built from the stage shape: loops, reduction loops,
    /// incoming edges, total calls, bytes per point and vector size.
    pub fn derived(
        num_loops: usize,
        num_rvars: usize,
        num_incoming: usize,
        total_calls: i64,
        bytes_per_point: i64,
        vector_size: i64,
    ) -> Self {
        Self {
            values: vec![
                num_loops as f64,
                num_rvars as f64,
                num_incoming as f64,
                total_calls as f64,
                bytes_per_point as f64,
                vector_size as f64,
            ],
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl AsRef<[f64]> for PipelineFeatures {
    fn as_ref(&self) -> &[f64] {
        &self.values
    }
}
