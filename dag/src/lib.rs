//! Pipeline dependency graph for the arbor scheduling core.
//!
//! A [`FunctionDag`] holds the funcs of a pipeline, the definition stages of
//! each func, and the producer/consumer edges between stages together with
//! the region of the producer each consumer iteration reads. The scheduler
//! only reads it.

pub mod builder;
pub mod error;
pub mod features;
pub mod graph;
pub mod span;

pub use builder::{DagBuilder, FuncDecl};
pub use error::{DagError, Result};
pub use features::PipelineFeatures;
pub use graph::{
    DimFootprint, Edge, EdgeId, FunctionDag, LoopKind, LoopVar, Node, NodeId, NodeMap, Stage, StageId, StageMap,
};
pub use span::Span;
