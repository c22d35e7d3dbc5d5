//! Read-only inputs shared by every scheduling operation.

use arbor_dag::FunctionDag;

use crate::config::AutoschedulerConfig;
use crate::target::Target;

/// The pipeline graph, configuration and target of one search run.
///
/// Cheap to copy; every component borrows the same three values, so states can
/// be evaluated from many threads at once.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub dag: &'a FunctionDag,
    pub config: &'a AutoschedulerConfig,
    pub target: &'a Target,
}

impl<'a> Context<'a> {
    pub fn new(dag: &'a FunctionDag, config: &'a AutoschedulerConfig, target: &'a Target) -> Self {
        Self { dag, config, target }
    }

    pub fn has_gpu(&self) -> bool {
        self.target.has_gpu
    }

    pub fn parallelism(&self) -> i64 {
        self.config.gpu.parallelism
    }
}
