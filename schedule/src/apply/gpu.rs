//! Mapping parallel loops onto the GPU grid and block.
//!
//! Parallel loops of a stage become up to three block dimensions, fused
//! where legal. Loops tagged as thread loops become up to three thread
//! dimensions. A final pass gives every stage with thread loops an enclosing
//! block loop, or runs it on a single thread.

use std::collections::BTreeSet;

use arbor_dag::StageMap;

use super::{Directive, LoopLevel, MemoryKind, OUTERMOST, StageScheduleState, StagedProducer, TailStrategy};
use crate::context::Context;
use crate::target::Target;

// ============================================================================
// BLOCKS
// ============================================================================

/// Whether all parallel loops fused together fit the first grid dimension.
pub fn can_fuse_gpu(parallel_extents: &[i64], target: &Target) -> bool {
    let total = parallel_extents.iter().fold(1i64, |acc, e| acc.saturating_mul(*e));
    total < target.max_blocks[0]
}

/// Assign parallel loops, given outermost first, to block dimensions.
///
/// Assignment starts from the innermost loop. The first two dimensions take
/// one loop each; the third fuses every remaining loop that still fits.
/// Constant loops of extent one are left out. Each dimension lists its
/// loops, the first being the one the others are fused into.
pub fn plan_block_fusion(parallel_extents: &[i64], constant_extents: &[bool], target: &Target) -> [Vec<usize>; 3] {
    let mut block_extents = [1i64; 3];
    let mut assignments: [Vec<usize>; 3] = Default::default();
    let mut remaining = parallel_extents.len();
    for block_i in 0..3 {
        while remaining > 0 {
            let k = remaining - 1;
            if parallel_extents[k].saturating_mul(block_extents[block_i]) > target.max_blocks[block_i] {
                break;
            }
            remaining -= 1;
            if parallel_extents[k] > 1 || !constant_extents[k] {
                block_extents[block_i] *= parallel_extents[k];
                assignments[block_i].push(k);
                if block_i < 2 {
                    break;
                }
            }
        }
    }
    assignments
}

pub fn fuse_gpu_blocks(
    state: &mut StageScheduleState,
    parallel_vars: &[String],
    parallel_extents: &[i64],
    constant_extents: &[bool],
    target: &Target,
) {
    if parallel_vars.is_empty() || parallel_extents.is_empty() {
        return;
    }

    let mut marked = false;
    for assigned in plan_block_fusion(parallel_extents, constant_extents, target) {
        let Some((&inner, rest)) = assigned.split_first() else {
            continue;
        };
        for &outer in rest {
            state.directives.push(Directive::Fuse {
                inner: parallel_vars[inner].clone(),
                outer: parallel_vars[outer].clone(),
                fused: parallel_vars[inner].clone(),
            });
        }
        state.directives.push(Directive::GpuBlocks(parallel_vars[inner].clone()));
        state.parallel = true;
        marked = true;
    }

    // Nothing but unit loops: a grid of one block.
    if !marked && parallel_extents.iter().all(|e| *e == 1) {
        let innermost = &parallel_vars[parallel_vars.len() - 1];
        state.directives.push(Directive::GpuBlocks(innermost.clone()));
        state.parallel = true;
    }
}

/// Number of leading parallel loops that map one-to-one onto block dimensions.
pub fn plan_unfused_blocks(parallel_extents: &[i64], target: &Target) -> usize {
    parallel_extents
        .iter()
        .zip(target.max_blocks)
        .take_while(|(extent, max)| **extent <= *max)
        .count()
}

pub fn mark_gpu_blocks(state: &mut StageScheduleState, parallel_vars: &[String], parallel_extents: &[i64], target: &Target) {
    let tagged = plan_unfused_blocks(parallel_extents, target);
    for v in &parallel_vars[..tagged] {
        state.directives.push(Directive::GpuBlocks(v.clone()));
    }
    if tagged > 0 {
        state.parallel = true;
    }
}

// ============================================================================
// THREADS
// ============================================================================

/// Indices into `state.vars` of the loops that become thread dimensions,
/// innermost first.
pub fn plan_gpu_threads(state: &StageScheduleState, target: &Target) -> Vec<usize> {
    let mut tagged = Vec::new();
    let mut total_threads = 1;
    for (i, v) in state.vars.iter().enumerate() {
        if !v.exists || !v.gpu_threads || v.extent == 1 {
            continue;
        }
        let dim = tagged.len();
        if dim >= 3 || v.extent > target.max_threads[dim] || total_threads * v.extent > target.max_threads_per_block {
            break;
        }
        total_threads *= v.extent;
        tagged.push(i);
    }
    tagged
}

/// Split every thread loop into a serial outer loop and a thread-sized
/// inner one. The first thread loop is also where staged producers are
/// copied into registers. Returns whether any thread loop exists.
pub fn mark_gpu_threads(
    state: &mut StageScheduleState,
    ctx: &Context,
    new_serial_vars: &mut BTreeSet<String>,
    staged: &mut Vec<StagedProducer>,
) -> bool {
    let tagged = plan_gpu_threads(state, ctx.target);
    for (k, &i) in tagged.iter().enumerate() {
        let v = state.vars[i].clone();
        let outer = format!("{}_serial_outer", v.var);
        new_serial_vars.insert(outer.clone());
        state.directives.push(Directive::Split {
            old: v.var.clone(),
            outer,
            inner: v.var.clone(),
            factor: v.extent,
            tail: Some(TailStrategy::GuardWithIf),
        });
        state.directives.push(Directive::GpuThreads(v.var.clone()));

        if k == 0 {
            stage_producers(state, &v.var, ctx, staged);
        }
    }
    !tagged.is_empty()
}

fn stage_producers(state: &StageScheduleState, var: &str, ctx: &Context, staged: &mut Vec<StagedProducer>) {
    let dag = ctx.dag;
    let consumer = dag.node(state.node);
    for (&producer, candidates) in &state.producers_to_be_staged {
        for c in candidates {
            if c.chain.len() > 1 {
                let chain: Vec<&str> = c.chain.iter().map(|e| dag.node(dag.edge(*e).producer).name.as_str()).collect();
                tracing::debug!(producer = %dag.node(producer).name, ?chain, "not staging through inlined funcs");
                continue;
            }
            let mut directives = vec![
                Directive::StoreIn(MemoryKind::Register),
                Directive::Compute(LoopLevel::At { func: consumer.name.clone(), var: var.to_string() }),
            ];
            for (v, extent) in &c.extents {
                directives.push(Directive::BoundExtent { var: v.clone(), extent: *extent });
                directives.push(Directive::Unroll(v.clone()));
            }
            staged.push(StagedProducer { producer, consumer: state.node, directives });
        }
    }
}

// ============================================================================
// REPAIR
// ============================================================================

/// Give every stage with thread loops an enclosing block loop.
///
/// Stages are visited outputs first, so an enclosing stage has its blocks by
/// the time its inner stages are checked. A stage with neither thread nor
/// block loops runs on a single thread. One with thread loops but no block
/// loop anywhere around it gets an extent-one outer loop marked as blocks.
pub fn repair_thread_loops(
    states: &mut StageMap<StageScheduleState>,
    ctx: &Context,
    new_serial_vars: &mut BTreeSet<String>,
    staged: &mut Vec<StagedProducer>,
) {
    for node in ctx.dag.nodes().iter().filter(|n| !n.is_input) {
        for s in &node.stages {
            let Some(state) = states.get(s) else {
                continue;
            };
            let has_enclosing_parallel =
                state.parallel || state.ancestors.iter().any(|a| states.get(a).is_some_and(|a| a.parallel));

            let Some(state) = states.get_mut(s) else {
                continue;
            };
            let thread_loop_exists = mark_gpu_threads(state, ctx, new_serial_vars, staged);
            if !thread_loop_exists && !has_enclosing_parallel {
                // Typically an update whose reduction runs serially.
                state.directives.push(Directive::GpuSingleThread);
                continue;
            }
            if !thread_loop_exists || has_enclosing_parallel {
                continue;
            }

            let Some(outer_var) = state.ordered_vars.last().cloned() else {
                panic!("apply invariant: {} has thread loops but no variables", ctx.dag.stage(*s).name);
            };
            let new_outer = format!("{}_outer", outer_var.var);
            state.directives.push(Directive::Split {
                old: outer_var.var.clone(),
                outer: new_outer.clone(),
                inner: outer_var.var.clone(),
                factor: outer_var.extent,
                tail: None,
            });
            new_serial_vars.insert(new_outer.clone());

            // Keep anything stored at the outermost level outside the new loop.
            let mut order: Vec<String> = state.ordered_vars.iter().map(|v| v.var.clone()).collect();
            order.push(new_outer.clone());
            order.push(OUTERMOST.to_string());
            state.directives.push(Directive::Reorder(order));
            state.directives.push(Directive::GpuBlocks(new_outer));
            state.parallel = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::apply::FuncVar;
    use crate::test::helpers::*;

    fn state_with_vars(vars: Vec<FuncVar>) -> StageScheduleState {
        let h = Harness::pointwise_1d(64).with_cpu();
        let ctx = h.ctx();
        let root = h.compute_root_all();
        let mut states = super::super::walk::Walk::new(&ctx, &root).run(&root);
        let (_, mut state) = states.pop_first().unwrap();
        state.vars = vars;
        state.directives.clear();
        state
    }

    fn thread_var(name: &str, extent: i64) -> FuncVar {
        FuncVar { var: name.into(), extent, exists: true, pure: true, gpu_threads: true, ..FuncVar::default() }
    }

    #[test_case(&[64, 64], &[0], &[1]; "one loop per dimension")]
    #[test_case(&[4, 4, 4, 4], &[3], &[2]; "outer loops fuse into the third dimension")]
    #[test_case(&[1, 1], &[], &[]; "unit loops are skipped")]
    fn test_block_fusion(extents: &[i64], dim0: &[usize], dim1: &[usize]) {
        let constant = vec![true; extents.len()];
        let plan = plan_block_fusion(extents, &constant, &Target::cuda());
        assert_eq!(plan[0], dim0);
        assert_eq!(plan[1], dim1);
    }

    #[test]
    fn test_third_dimension_fuses_remaining_loops() {
        let plan = plan_block_fusion(&[4, 4, 4, 4], &[true; 4], &Target::cuda());
        assert_eq!(plan[2], vec![1, 0]);
    }

    #[test]
    fn test_oversized_loop_is_not_fused() {
        let target = Target::cuda();
        let plan = plan_block_fusion(&[70_000, 8], &[true, true], &target);
        assert_eq!(plan[0], vec![1]);
        // Too large for dimension 1 and nothing left for dimension 2.
        assert!(plan[1].is_empty() && plan[2].is_empty());
        assert!(can_fuse_gpu(&[70_000, 8], &target));
        assert!(!can_fuse_gpu(&[1 << 20, 1 << 20], &target));
    }

    #[test]
    fn test_unfused_blocks_stop_at_limit() {
        let target = Target::cuda();
        assert_eq!(plan_unfused_blocks(&[100, 100, 100, 100], &target), 3);
        assert_eq!(plan_unfused_blocks(&[100, 70_000, 100], &target), 1);
    }

    #[test]
    fn test_all_unit_loops_get_one_block() {
        let mut state = state_with_vars(Vec::new());
        fuse_gpu_blocks(&mut state, &["x".into(), "y".into()], &[1, 1], &[true, true], &Target::cuda());
        assert_eq!(state.directives, vec![Directive::GpuBlocks("y".into())]);
        assert!(state.parallel);
    }

    #[test]
    fn test_fusion_directives() {
        let mut state = state_with_vars(Vec::new());
        let vars: Vec<String> = ["w", "z", "y", "x"].iter().map(|s| s.to_string()).collect();
        fuse_gpu_blocks(&mut state, &vars, &[4, 4, 4, 4], &[true; 4], &Target::cuda());
        assert_eq!(
            state.directives,
            vec![
                Directive::GpuBlocks("x".into()),
                Directive::GpuBlocks("y".into()),
                Directive::Fuse { inner: "z".into(), outer: "w".into(), fused: "z".into() },
                Directive::GpuBlocks("z".into()),
            ]
        );
    }

    #[test]
    fn test_thread_limits() {
        let target = Target::cuda();
        let state = state_with_vars(vec![thread_var("xi", 32), thread_var("yi", 8), thread_var("zi", 4), thread_var("wi", 2)]);
        assert_eq!(plan_gpu_threads(&state, &target), vec![0, 1, 2]);

        // 32 × 64 exceeds the block.
        let state = state_with_vars(vec![thread_var("xi", 32), thread_var("yi", 64)]);
        assert_eq!(plan_gpu_threads(&state, &target), vec![0]);

        // The third dimension holds at most 64 threads.
        let state = state_with_vars(vec![thread_var("xi", 2), thread_var("yi", 2), thread_var("zi", 128)]);
        assert_eq!(plan_gpu_threads(&state, &target), vec![0, 1]);
    }

    #[test]
    fn test_thread_split_directives() {
        let h = Harness::pointwise_1d(64);
        let ctx = h.ctx();
        let mut state = state_with_vars(vec![thread_var("xi", 32), FuncVar { exists: false, ..thread_var("yi", 1) }]);
        let mut serial = BTreeSet::new();
        let mut staged = Vec::new();
        assert!(mark_gpu_threads(&mut state, &ctx, &mut serial, &mut staged));
        assert_eq!(serial, BTreeSet::from(["xi_serial_outer".to_string()]));
        assert_eq!(
            state.directives,
            vec![
                Directive::Split {
                    old: "xi".into(),
                    outer: "xi_serial_outer".into(),
                    inner: "xi".into(),
                    factor: 32,
                    tail: Some(TailStrategy::GuardWithIf),
                },
                Directive::GpuThreads("xi".into()),
            ]
        );
        assert!(staged.is_empty());
    }
}
