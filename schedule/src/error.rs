use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScheduleError {
    #[snafu(display("environment variable {var} has invalid value '{value}'"))]
    InvalidEnv { var: &'static str, value: String },

    #[snafu(display("failed to write feature dump: {source}"))]
    FeatureDump { source: std::io::Error },

    #[snafu(display("state cannot be featurized: {reason}"))]
    Unfeaturizable { reason: crate::feasibility::Infeasibility },

    #[snafu(display("cost model failed: {message}"))]
    CostModel { message: String },

    #[snafu(display("search finished without a complete schedule"))]
    NoValidSchedule,

    #[snafu(display("state has made {made} of {required} decisions and cannot be applied"))]
    IncompleteState { made: usize, required: usize },
}

pub type Result<T, E = ScheduleError> = std::result::Result<T, E>;
