//! Loop-nest search core of the GPU auto-scheduler.
//!
//! A candidate schedule is a tree of loops ([`loop_nest`]) wrapped in a
//! [`SearchState`]. States are featurized ([`featurize`]), filtered by GPU
//! resource limits ([`feasibility`]) and scored through the two-phase
//! [`CostModel`] contract. The best complete state is lowered into scheduling
//! directives and a reproducible source rendering ([`apply`]).
//!
//! # Module Organization
//!
//! - [`loop_nest`] - Loop-nest tree, bounds and schedule edits
//! - [`state`] - Search states and costing
//! - [`featurize`] - Per-stage schedule features
//! - [`feasibility`] - Shared, local memory and thread limits
//! - [`cost`] - Cost-model contract and analytic reference scorer
//! - [`search`] - Beam search over schedule decisions
//! - [`apply`] - Schedule materialization

pub mod apply;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod feasibility;
pub mod featurize;
pub mod loop_nest;
pub mod search;
pub mod state;
pub mod target;

#[cfg(test)]
pub mod test;

pub use apply::{Directive, Materialized, ScheduleSink, Scheduled, apply_schedule, sanitize_names};
pub use config::{AutoschedulerConfig, FeatureOptions, GpuParams, SearchOptions, SearchSpaceOptions};
pub use context::Context;
pub use cost::{AnalyticCostModel, CostModel, CostOutcome, CostTicket, Evaluation, INFEASIBLE_COST};
pub use error::{Result, ScheduleError};
pub use feasibility::Infeasibility;
pub use featurize::{NUM_SCHEDULE_FEATURES, ScheduleFeatures, featurize};
pub use loop_nest::{GpuRole, LoopNest};
pub use search::{SearchResult, SearchStats, beam_search};
pub use state::SearchState;
pub use target::Target;
