//! Schedule materialization.
//!
//! A finished loop nest becomes a chain of [`Directive`]s per stage: the
//! splits implied by its tilings, loop order, vectorization, unrolling,
//! compute and store levels, and the GPU block and thread mapping. The
//! directives go to a [`ScheduleSink`] standing in for the live pipeline and
//! are rendered as a program that reproduces the schedule.
//!
//! # Module Organization
//!
//! - `walk` - per-stage schedule state built from the loop nest
//! - [`gpu`] - block fusion, thread assignment and the thread-loop repair pass
//! - `source` - textual rendering and name sanitizing

use std::collections::BTreeSet;
use std::fmt;

use arbor_dag::{NodeId, StageId, StageMap};

use crate::context::Context;
use crate::loop_nest::LoopNest;

pub mod gpu;
mod source;
mod walk;

pub use source::{ScheduleSource, sanitize_names};
pub use walk::{FuncVar, StageScheduleState, StagingCandidate};

/// Name standing for the outermost loop level of a stage in a reorder.
pub const OUTERMOST: &str = "__outermost";

// ============================================================================
// DIRECTIVES
// ============================================================================

/// How a split handles a factor that does not divide the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TailStrategy {
    Auto,
    /// Round the extent up; only safe when nothing reads inputs or writes
    /// outputs past the region.
    RoundUp,
    /// Shift the last iteration inwards and recompute the overlap.
    ShiftInwards,
    GuardWithIf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum MemoryKind {
    Stack,
    Register,
}

/// A loop level a func can be computed or stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopLevel {
    Root,
    At { func: String, var: String },
    Outermost { func: String },
}

impl LoopLevel {
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }
}

/// Suffix of `compute` and `store`: `_root()` or `_at(f, x)`.
impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "_root()"),
            Self::At { func, var } => write!(f, "_at({func}, {var})"),
            Self::Outermost { func } => write!(f, "_at({func}, Var::outermost())"),
        }
    }
}

/// One scheduling directive applied to a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `tail` is `None` where the pipeline's default applies.
    Split { old: String, outer: String, inner: String, factor: i64, tail: Option<TailStrategy> },
    Fuse { inner: String, outer: String, fused: String },
    /// Innermost first.
    Reorder(Vec<String>),
    ReorderStorage(Vec<String>),
    Vectorize(String),
    Unroll(String),
    Parallel(String),
    GpuBlocks(String),
    GpuThreads(String),
    GpuSingleThread,
    Compute(LoopLevel),
    Store(LoopLevel),
    StoreIn(MemoryKind),
    BoundExtent { var: String, extent: i64 },
}

fn var_name(v: &str) -> &str {
    if v == OUTERMOST { "Var::outermost()" } else { v }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split { old, outer, inner, factor, tail: Some(tail) } => {
                write!(f, ".split({old}, {outer}, {inner}, {factor}, TailStrategy::{tail})")
            }
            Self::Split { old, outer, inner, factor, tail: None } => write!(f, ".split({old}, {outer}, {inner}, {factor})"),
            Self::Fuse { inner, outer, fused } => write!(f, ".fuse({inner}, {outer}, {fused})"),
            Self::Reorder(vars) => write!(f, ".reorder({})", vars.iter().map(|v| var_name(v)).collect::<Vec<_>>().join(", ")),
            Self::ReorderStorage(vars) => write!(f, ".reorder_storage({})", vars.join(", ")),
            Self::Vectorize(v) => write!(f, ".vectorize({v})"),
            Self::Unroll(v) => write!(f, ".unroll({v})"),
            Self::Parallel(v) => write!(f, ".parallel({v})"),
            Self::GpuBlocks(v) => write!(f, ".gpu_blocks({v})"),
            Self::GpuThreads(v) => write!(f, ".gpu_threads({v})"),
            Self::GpuSingleThread => write!(f, ".gpu_single_thread()"),
            Self::Compute(level) => write!(f, ".compute{level}"),
            Self::Store(level) => write!(f, ".store{level}"),
            Self::StoreIn(kind) => write!(f, ".store_in(MemoryType::{kind})"),
            Self::BoundExtent { var, extent } => write!(f, ".bound_extent({var}, {extent})"),
        }
    }
}

// ============================================================================
// SINK
// ============================================================================

/// What a directive is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Stage(StageId),
    /// The register copy of `producer` staged inside `consumer`.
    Staged { producer: NodeId, consumer: NodeId },
}

/// Receiver of materialized directives, typically the live pipeline.
pub trait ScheduleSink {
    fn apply(&mut self, on: Scheduled, directive: &Directive);
}

/// Records every directive in order.
impl ScheduleSink for Vec<(Scheduled, Directive)> {
    fn apply(&mut self, on: Scheduled, directive: &Directive) {
        self.push((on, directive.clone()));
    }
}

/// A producer copied into registers at the first thread loop of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedProducer {
    pub producer: NodeId,
    pub consumer: NodeId,
    pub directives: Vec<Directive>,
}

/// Everything a materialization produced.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub stages: StageMap<StageScheduleState>,
    pub staged: Vec<StagedProducer>,
    /// Variables introduced by thread and block splits.
    pub new_serial_vars: BTreeSet<String>,
    pub source: String,
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Materialize the schedule of `root`, sending every directive to `sink`.
#[tracing::instrument(skip_all, fields(gpu = ctx.has_gpu()))]
pub fn apply_schedule(root: &LoopNest, ctx: &Context, sink: &mut dyn ScheduleSink) -> Materialized {
    let dag = ctx.dag;
    let mut stages = walk::Walk::new(ctx, root).run(root);

    for state in stages.values_mut() {
        order_and_parallelize(state, ctx);
    }

    let mut new_serial_vars = BTreeSet::new();
    let mut staged = Vec::new();
    if ctx.has_gpu() {
        gpu::repair_thread_loops(&mut stages, ctx, &mut new_serial_vars, &mut staged);
    }

    for (s, state) in &stages {
        for d in &state.directives {
            sink.apply(Scheduled::Stage(*s), d);
        }
    }
    for p in &staged {
        for d in &p.directives {
            sink.apply(Scheduled::Staged { producer: p.producer, consumer: p.consumer }, d);
        }
    }

    let source = ScheduleSource { dag, stages: &stages, new_serial_vars: &new_serial_vars, staged: &staged }.to_string();
    let source = sanitize_names(&source);
    tracing::debug!(stages = stages.len(), staged = staged.len(), "schedule materialized");
    Materialized { stages, staged, new_serial_vars, source }
}

/// Fix the loop order of a stage and map its outer parallel loops onto GPU
/// blocks, or onto CPU threads.
fn order_and_parallelize(state: &mut StageScheduleState, ctx: &Context) {
    let dag = ctx.dag;

    // Outermost first.
    let mut parallel_vars = Vec::new();
    let mut parallel_extents = Vec::new();
    let mut constant_extents = Vec::new();
    let (mut any_parallel_vars, mut any_parallel_rvars) = (false, false);
    for v in state.vars.iter().rev().filter(|v| v.exists) {
        if !v.parallel {
            break;
        }
        any_parallel_rvars |= v.is_rvar;
        any_parallel_vars |= !v.is_rvar;
        parallel_vars.push(v.var.clone());
        parallel_extents.push(v.extent);
        constant_extents.push(v.constant_extent);
    }

    state.ordered_vars = state.vars.iter().filter(|v| v.exists).cloned().collect();
    if state.vars.len() > 1 {
        let order = state.ordered_vars.iter().map(|v| v.var.clone()).collect();
        state.directives.push(Directive::Reorder(order));
    }

    if ctx.has_gpu() {
        // Pure and reduction variables cannot be fused together.
        let can_fuse = !(any_parallel_vars && any_parallel_rvars) && gpu::can_fuse_gpu(&parallel_extents, ctx.target);
        if can_fuse {
            gpu::fuse_gpu_blocks(state, &parallel_vars, &parallel_extents, &constant_extents, ctx.target);
        } else {
            gpu::mark_gpu_blocks(state, &parallel_vars, &parallel_extents, ctx.target);
        }
    } else {
        for v in &parallel_vars {
            state.directives.push(Directive::Parallel(v.clone()));
        }
    }
    if !parallel_vars.is_empty() {
        state.parallel = true;
    }

    // Vectorized dimension innermost in storage.
    if dag.stage(state.stage).index == 0
        && let Some(vd) = state.vector_dim
        && vd > 0
    {
        let mut storage = dag.node(state.node).args.clone();
        storage[..=vd].rotate_right(1);
        state.directives.push(Directive::ReorderStorage(storage));
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::loop_nest::{GpuRole, TileOptions};
    use crate::test::helpers::*;

    #[test_case(Directive::Split { old: "x".into(), outer: "x".into(), inner: "xi".into(), factor: 8, tail: Some(TailStrategy::RoundUp) }, ".split(x, x, xi, 8, TailStrategy::RoundUp)"; "split")]
    #[test_case(Directive::Split { old: "y".into(), outer: "y_outer".into(), inner: "y".into(), factor: 4, tail: None }, ".split(y, y_outer, y, 4)"; "split without tail")]
    #[test_case(Directive::Reorder(vec!["xi".into(), "x".into(), OUTERMOST.into()]), ".reorder(xi, x, Var::outermost())"; "reorder")]
    #[test_case(Directive::Compute(LoopLevel::At { func: "f".into(), var: "x".into() }), ".compute_at(f, x)"; "compute at")]
    #[test_case(Directive::Store(LoopLevel::Root), ".store_root()"; "store root")]
    #[test_case(Directive::StoreIn(MemoryKind::Register), ".store_in(MemoryType::Register)"; "store in")]
    fn test_directive_rendering(d: Directive, expected: &str) {
        assert_eq!(d.to_string(), expected);
    }

    #[test]
    fn test_cpu_compute_root_schedule() {
        let h = Harness::pointwise_2d(1024, 1024).with_cpu();
        let ctx = h.ctx();
        let mut root = h.compute_root_all();
        let tiled = root.children[0].parallelize_in_tiles(&[64, 16], &root, TileOptions::inner(false), &ctx);
        root.children[0] = tiled;

        let mut sink: Vec<(Scheduled, Directive)> = Vec::new();
        let m = apply_schedule(&root, &ctx, &mut sink);
        let out = h.dag().node(h.node("out")).stages[0];
        let directives = &m.stages[&out].directives;

        assert!(directives.contains(&Directive::Compute(LoopLevel::Root)));
        assert!(directives.iter().any(|d| matches!(d, Directive::Parallel(_))));
        assert!(directives.iter().any(|d| matches!(d, Directive::Vectorize(_))));
        assert!(!directives.iter().any(|d| matches!(d, Directive::GpuBlocks(_) | Directive::GpuThreads(_))));
        assert_eq!(sink.len(), directives.len());
        assert!(m.source.starts_with("auto pipeline = get_pipeline();\nFunc out = pipeline.get_func(1);\n"));
        assert!(m.source.contains(".compute_root()"));
    }

    #[test]
    fn test_gpu_schedule_gets_blocks_and_threads() {
        let h = Harness::pointwise_2d(1024, 1024);
        let ctx = h.ctx();
        let mut root = h.compute_root_all();
        // 256 × 1024 vectors of 4 lanes: 16 × 64 tiles, then 2 × 8 blocks of 8 × 8 threads.
        let parallel = root.children[0].parallelize_in_tiles(&[16, 16], &root, TileOptions::inner(false), &ctx);
        assert_eq!(parallel.gpu_role, GpuRole::Parallelized);
        root.children[0] = parallel.parallelize_in_tiles(&[8, 8], &root, TileOptions::inner(false), &ctx);
        assert_eq!(root.children[0].gpu_role, GpuRole::Block);
        assert_eq!(root.children[0].children[0].size.as_slice(), &[8, 8]);

        let mut sink: Vec<(Scheduled, Directive)> = Vec::new();
        let m = apply_schedule(&root, &ctx, &mut sink);
        let out = h.dag().node(h.node("out")).stages[0];
        let directives = &m.stages[&out].directives;
        assert!(directives.iter().any(|d| matches!(d, Directive::GpuBlocks(_))));
        assert!(directives.iter().any(|d| matches!(d, Directive::GpuThreads(_))));
        assert!(!directives.contains(&Directive::GpuSingleThread));
        assert!(m.source.contains("_serial_outer"));
    }

    #[test]
    fn test_serial_gpu_stage_runs_single_threaded() {
        let h = Harness::reduction(64, 128);
        let ctx = h.ctx();
        let root = h.compute_root_all();
        let m = apply_schedule(&root, &ctx, &mut Vec::new());
        let sum = h.dag().node(h.node("sum"));
        for s in &sum.stages {
            assert!(m.stages[s].directives.contains(&Directive::GpuSingleThread), "{}", h.dag().stage(*s).name);
        }
    }
}
