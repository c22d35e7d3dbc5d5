use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum DagError {
    #[snafu(display("func '{name}' is declared more than once"))]
    DuplicateFunc { name: String },

    #[snafu(display("reference to undeclared func '{name}'"))]
    UnknownFunc { name: String },

    #[snafu(display("func '{func}' has no stage {stage}"))]
    UnknownStage { func: String, stage: usize },

    #[snafu(display("footprint of {producer} -> {consumer} has {found} dimensions, producer has {expected}"))]
    FootprintRank { producer: String, consumer: String, expected: usize, found: usize },

    #[snafu(display("footprint of {producer} -> {consumer} reads loop {loop_index}, stage has {num_loops} loops"))]
    FootprintLoop { producer: String, consumer: String, loop_index: usize, num_loops: usize },

    #[snafu(display("pure loop of '{func}' refers to dimension {dim}, func has {dimensions}"))]
    PureDimOutOfRange { func: String, dim: usize, dimensions: usize },

    #[snafu(display("pipeline contains a cycle through '{name}'"))]
    Cycle { name: String },

    #[snafu(display("output '{name}' needs an estimated region with {dimensions} dimensions"))]
    MissingEstimate { name: String, dimensions: usize },

    #[snafu(display("input '{name}' cannot have update stages"))]
    InputWithUpdate { name: String },

    #[snafu(display("'{name}' reads itself; self references are not edges"))]
    SelfReference { name: String },

    #[snafu(display("func '{name}' is neither an output nor read by any stage"))]
    DeadFunc { name: String },

    #[snafu(display("pipeline has no outputs"))]
    NoOutputs,
}

pub type Result<T, E = DagError> = std::result::Result<T, E>;
