//! Per-stage schedule features extracted from a complete loop nest.
//!
//! Featurization runs in three passes over the feature root of a state:
//! [`sites`] locates where every func is computed and stored, register
//! promotion decides which thread-local allocations stay in registers, and
//! [`compute`] walks the tree accumulating the features of every stage.
//! Root-level subtrees memoize their features keyed by a hash of the producers
//! stored at root, so unchanged subtrees are not walked again.

mod compute;
pub mod dump;
mod root;
pub mod sites;

use std::fmt;

use arbor_dag::StageMap;

use crate::context::Context;
use crate::loop_nest::LoopNest;

pub use dump::save_featurization;
pub use root::root_for_features;
pub use sites::MemoryType;

// ============================================================================
// FEATURE LAYOUT
// ============================================================================

macro_rules! schedule_features {
    ($($(#[$doc:meta])* $name:ident = $default:expr),* $(,)?) => {
        /// Schedule-dependent features of one stage, in cost-model order.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct ScheduleFeatures {
            $($(#[$doc])* pub $name: f64,)*
        }

        impl Default for ScheduleFeatures {
            fn default() -> Self {
                Self { $($name: $default,)* }
            }
        }

        /// Number of schedule features per stage.
        pub const NUM_SCHEDULE_FEATURES: usize = [$(stringify!($name)),*].len();

        impl ScheduleFeatures {
            pub const NAMES: [&'static str; NUM_SCHEDULE_FEATURES] = [$(stringify!($name)),*];

            pub fn values(&self) -> [f64; NUM_SCHEDULE_FEATURES] {
                [$(self.$name),*]
            }
        }
    };
}

schedule_features! {
    /// Times storage for the func is allocated.
    num_realizations = 0.0,
    /// Times a production of the stage starts.
    num_productions = 0.0,
    points_computed_per_realization = 0.0,
    points_computed_per_production = 0.0,
    points_computed_per_thread = 0.0,
    points_computed_total = 0.0,
    /// Points computed by the cheapest legal schedule of the func.
    points_computed_minimum = 0.0,
    innermost_loop_extent = 0.0,
    innermost_pure_loop_extent = 0.0,
    unrolled_loop_extent = 0.0,
    inner_parallelism = 0.0,
    outer_parallelism = 0.0,
    bytes_at_realization = 0.0,
    bytes_at_production = 0.0,
    bytes_at_root = 0.0,
    innermost_bytes_at_realization = 0.0,
    innermost_bytes_at_production = 0.0,
    innermost_bytes_at_root = 0.0,
    inlined_calls = 0.0,
    unique_global_bytes_read_per_realization = 0.0,
    unique_shared_bytes_read_per_realization = 0.0,
    unique_register_bytes_read_per_realization = 0.0,
    unique_global_lines_read_per_realization = 0.0,
    unique_shared_lines_read_per_realization = 0.0,
    unique_register_lines_read_per_realization = 0.0,
    unique_global_bytes_read_per_thread = 0.0,
    unique_shared_bytes_read_per_thread = 0.0,
    unique_register_bytes_read_per_thread = 0.0,
    unique_global_lines_read_per_thread = 0.0,
    unique_shared_lines_read_per_thread = 0.0,
    unique_register_lines_read_per_thread = 0.0,
    global_allocation_bytes_read_per_realization = 0.0,
    shared_allocation_bytes_read_per_realization = 0.0,
    register_allocation_bytes_read_per_realization = 0.0,
    working_set = 0.0,
    num_scalars = 0.0,
    global_bytes_at_task = 0.0,
    shared_bytes_at_task = 0.0,
    register_bytes_at_task = 0.0,
    global_innermost_bytes_at_task = 0.0,
    shared_innermost_bytes_at_task = 0.0,
    register_innermost_bytes_at_task = 0.0,
    unique_bytes_read_per_point = 0.0,
    unique_lines_read_per_point = 0.0,
    unique_bytes_read_per_task = 0.0,
    unique_lines_read_per_task = 0.0,
    working_set_at_task = 0.0,
    working_set_at_production = 0.0,
    working_set_at_realization = 0.0,
    working_set_at_root = 0.0,
    num_blocks = 1.0,
    num_warps_per_block = 0.0,
    block_occupancy = 1.0 / 1024.0,
    warp_lane_utilization = 1.0 / 32.0,
    num_active_warps_per_block = 0.0,
    warp_lane_utilization_at_block_y = 1.0,
    warp_lane_utilization_at_block_z = 1.0,
    idle_lane_wastage = 0.0,
    num_shared_mem_loads_per_block = 0.0,
    num_global_mem_loads_per_block = 0.0,
    num_shared_mem_stores_per_block = 0.0,
    num_global_mem_stores_per_block = 0.0,
    shared_mem_store_efficiency = 1.0,
    shared_mem_load_efficiency = 1.0,
    global_mem_store_efficiency = 1.0,
    global_mem_load_efficiency = 1.0,
    working_set_at_thread = 0.0,
    shared_mem_occupancy = 0.0,
    shared_mem_block_limit_factor = 1.0,
    max_warp_occupancy = 0.0,
    max_block_occupancy = 0.0,
    num_threads_per_block = 0.0,
    /// Register pressure proxy of the expression computed at the innermost loop.
    expr_branching = 0.0,
}

impl fmt::Display for ScheduleFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in Self::NAMES.iter().zip(self.values()) {
            writeln!(f, "    {name:<44} {value:e}")?;
        }
        Ok(())
    }
}

// ============================================================================
// MEMOIZATION
// ============================================================================

/// Contribution of a func inlined into one consumer stage.
///
/// Inlined funcs have no loops of their own, so their features are sums of
/// these per-consumer records.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureIntermediates {
    pub inlined_calls: f64,
    pub num_scalars: f64,
    pub innermost_pure_loop_extent: f64,
    pub outer_parallelism: f64,
    pub num_warps_per_block: f64,
    pub num_threads_per_block: f64,
    pub points_computed_per_thread: f64,
}

impl FeatureIntermediates {
    fn accumulate(&self, feat: &mut ScheduleFeatures) {
        feat.inlined_calls += self.inlined_calls;
        feat.num_scalars += self.num_scalars;
        feat.innermost_pure_loop_extent = self.innermost_pure_loop_extent;
        feat.outer_parallelism = self.outer_parallelism;
        feat.num_blocks = self.outer_parallelism;
        feat.inner_parallelism = 1.0;
        feat.num_warps_per_block += self.num_warps_per_block;
        feat.num_threads_per_block += self.num_threads_per_block;
        feat.points_computed_per_thread += self.points_computed_per_thread;
    }
}

/// Inlined func stage → consumer stage → contribution.
pub type InlinedIntermediates = StageMap<StageMap<FeatureIntermediates>>;

/// Everything a root-level loop nest contributes to a featurization.
#[derive(Debug, Clone, Default)]
pub struct FeatureMemo {
    /// Features of the stages computed inside the loop nest.
    pub features: StageMap<ScheduleFeatures>,
    /// Contributions of funcs inlined inside the loop nest.
    pub intermediates: InlinedIntermediates,
    /// Bytes of every func stored inside the loop nest.
    pub working_set: i64,
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Counters of one featurization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureStats {
    pub memo_hits: usize,
    pub memo_misses: usize,
}

/// Featurize a complete loop nest, already converted with
/// [`root_for_features`].
///
/// Returns `None` when an allocation inside a thread loop cannot be promoted
/// to registers; such states are infeasible.
#[tracing::instrument(skip_all, fields(use_memoized))]
pub fn featurize(root: &LoopNest, ctx: &Context, use_memoized: bool) -> Option<(StageMap<ScheduleFeatures>, FeatureStats)> {
    let mut sites = sites::SiteMap::collect(root, ctx);
    if ctx.has_gpu() && !sites.promote_allocs_to_registers(root, ctx) {
        tracing::trace!("allocation cannot be promoted to registers");
        return None;
    }
    sites.finish(root, ctx);
    let result = compute::FeatureWalk::new(ctx, &sites, root, use_memoized).run();
    Some(result)
}

/// Sum inlined contributions into their func's features.
fn apply_intermediates(features: &mut StageMap<ScheduleFeatures>, intermediates: &InlinedIntermediates) {
    for (inlined, per_consumer) in intermediates {
        let feat = features.entry(*inlined).or_default();
        for contribution in per_consumer.values() {
            contribution.accumulate(feat);
        }
    }
}

fn merge_intermediates(into: &mut InlinedIntermediates, from: &InlinedIntermediates) {
    for (inlined, per_consumer) in from {
        let entry = into.entry(*inlined).or_default();
        for (consumer, contribution) in per_consumer {
            entry.insert(*consumer, *contribution);
        }
    }
}
