//! Hardware limits a candidate schedule must respect before it is costed.
//!
//! Every check is a pure predicate over the loop nest. A failed check is not
//! an error: the state is simply never costed.

use std::collections::BTreeSet;

use arbor_dag::{FunctionDag, NodeId};

use crate::context::Context;
use crate::loop_nest::LoopNest;

/// Why a state was rejected before costing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Infeasibility {
    /// Some block would need more threads than a block can hold.
    InvalidThreadExtents,
    /// A block's shared allocations exceed the per-block limit.
    SharedMemory,
    /// Thread-private allocations exceed the stack or local memory budget.
    LocalMemory,
    /// A serial GPU loop iterates too many times.
    SerialExtents,
    /// A thread-private allocation cannot live in registers.
    RegisterPromotion,
}

/// Run the checks in order and report the first that fails.
pub fn check(root: &LoopNest, ctx: &Context) -> Result<(), Infeasibility> {
    if !root.has_valid_thread_extents(ctx) {
        return Err(Infeasibility::InvalidThreadExtents);
    }
    if exceeds_shared_memory_limit(root, ctx) {
        return Err(Infeasibility::SharedMemory);
    }
    if exceeds_local_memory_limit(root, ctx) {
        return Err(Infeasibility::LocalMemory);
    }
    if exceeds_serial_extents_limit(root, ctx) {
        return Err(Infeasibility::SerialExtents);
    }
    Ok(())
}

/// Bytes allocated at or below `nest` for storage shared by the threads of
/// `block`. Allocations inside thread loops are private and not counted.
pub fn shared_mem_alloc_size(block: &LoopNest, nest: &LoopNest, dag: &FunctionDag) -> i64 {
    if nest.is_gpu_thread() {
        return 0;
    }
    let here: i64 = nest
        .store_at
        .iter()
        .filter(|f| dag.node(**f).dimensions() > 0)
        .map(|f| {
            let bounds = block.get_bounds(*f, dag);
            dag.node(*f).bytes_per_point * bounds.points_computed()
        })
        .sum();
    here + nest.children.iter().map(|c| shared_mem_alloc_size(block, c, dag)).sum::<i64>()
}

/// A limit of zero disables the check. A block using exactly the limit fits.
pub fn exceeds_shared_memory_limit(root: &LoopNest, ctx: &Context) -> bool {
    let limit = ctx.config.gpu.shared_memory_limit();
    if !ctx.has_gpu() || limit == 0 {
        return false;
    }
    root.children.iter().any(|c| shared_mem_alloc_size(c, c, ctx.dag) > limit)
}

/// Statically sized thread-private allocations are held to the stack budget,
/// all of them together to the local memory limit.
pub fn exceeds_local_memory_limit(root: &LoopNest, ctx: &Context) -> bool {
    if !ctx.has_gpu() {
        return false;
    }
    let stack_limit = ctx.target.stack_memory_limit(ctx.config.gpu.stack_factor);
    root.children.iter().any(|c| {
        c.get_total_local_mem_alloc_size(true, false, ctx.dag) > stack_limit
            || c.get_total_local_mem_alloc_size(false, false, ctx.dag) > ctx.target.local_memory_limit
    })
}

pub fn exceeds_serial_extents_limit(root: &LoopNest, ctx: &Context) -> bool {
    ctx.has_gpu() && root.exceeds_serial_extents_limit(ctx)
}

pub fn has_dynamic_allocation_inside_thread(root: &LoopNest, ctx: &Context) -> bool {
    root.has_dynamic_allocation_inside_thread(false, ctx.dag)
}

/// On GPU, funcs may only be stored at root or directly in a root-level
/// loop. Anything stored deeper would be hoisted to the block and grow the
/// shared allocation.
pub fn contains_store_at_further_in_than_outermost(root: &LoopNest) -> bool {
    root.children
        .iter()
        .any(|c| c.children.iter().any(|gc| contains_store_at(root, &c.store_at, gc)))
}

fn contains_store_at(root: &LoopNest, outermost: &BTreeSet<NodeId>, parent: &LoopNest) -> bool {
    parent.children.iter().any(|c| {
        if !c.store_at.is_empty() {
            return true;
        }
        // A production not stored at root or the outermost loop is
        // implicitly stored at its parent.
        let at_production = c.node != parent.node;
        if at_production
            && let Some(n) = c.node
            && !root.store_at.contains(&n)
            && !outermost.contains(&n)
        {
            return true;
        }
        contains_store_at(root, outermost, c)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use test_case::test_case;

    use crate::config::GpuParams;
    use crate::loop_nest::{GpuRole, TileOptions};
    use crate::test::helpers::*;

    use super::*;

    /// blur_y in blocks of 128 × 8 points with blur_x stored in each block:
    /// 4 bytes × 128 × 10 rows = 5 KiB of shared memory.
    fn blocked_blur(h: &Harness) -> LoopNest {
        let ctx = h.ctx();
        let (by, bx) = (h.node("blur_y"), h.node("blur_x"));
        let mut root = LoopNest::root();
        root.compute_here(by, true, 0, false, &ctx);
        root.store_at.insert(by);

        let outer = root.children[0].parallelize_in_tiles(&[32, 8], &root, TileOptions::inner(false), &ctx);
        let mut block = (*outer).clone();
        block.gpu_role = GpuRole::Block;
        block.compute_here(bx, true, 0, false, &ctx);
        block.store_at.insert(bx);
        root.children[0] = Arc::new(block);
        root
    }

    fn block_bytes(h: &Harness, root: &LoopNest) -> i64 {
        shared_mem_alloc_size(&root.children[0], &root.children[0], h.dag())
    }

    #[test]
    fn test_shared_memory_at_limit_is_feasible() {
        let h = Harness::blur();
        let root = blocked_blur(&h);
        let bytes = block_bytes(&h, &root);
        assert_eq!(bytes, 5 * 1024);

        let at_limit = h.with_config(|c| c.gpu = GpuParams::builder().shared_memory_limit_kb(bytes / 1024).build());
        let root = blocked_blur(&at_limit);
        assert!(!exceeds_shared_memory_limit(&root, &at_limit.ctx()));
    }

    #[test]
    fn test_shared_memory_over_limit_is_rejected() {
        let h = Harness::blur();
        let root = blocked_blur(&h);
        let bytes = block_bytes(&h, &root);

        let under = Harness::blur().with_config(|c| c.gpu.shared_memory_limit_kb = bytes / 1024 - 1);
        let root = blocked_blur(&under);
        assert!(exceeds_shared_memory_limit(&root, &under.ctx()));
        assert_eq!(check(&root, &under.ctx()), Err(Infeasibility::SharedMemory));
    }

    #[test_case(1024, false ; "exactly the limit")]
    #[test_case(1025, true ; "one byte over")]
    fn test_shared_memory_limit_is_exact_to_the_byte(bytes: i64, over: bool) {
        let h = Harness::single_point_read(bytes).with_config(|c| c.gpu.shared_memory_limit_kb = 1);
        let root = h.block_with_producer("out", "f", false);
        assert_eq!(block_bytes(&h, &root), bytes);
        assert_eq!(exceeds_shared_memory_limit(&root, &h.ctx()), over);
        let expected = if over { Err(Infeasibility::SharedMemory) } else { Ok(()) };
        assert_eq!(check(&root, &h.ctx()), expected);
    }

    #[test]
    fn test_zero_shared_limit_disables_check() {
        let h = Harness::blur().with_config(|c| c.gpu.shared_memory_limit_kb = 0);
        let root = blocked_blur(&h);
        assert!(!exceeds_shared_memory_limit(&root, &h.ctx()));
    }

    #[test]
    fn test_cpu_skips_gpu_checks() {
        let h = Harness::blur().with_cpu().with_config(|c| c.gpu.shared_memory_limit_kb = 1);
        let root = h.compute_root_all();
        assert_eq!(check(&root, &h.ctx()), Ok(()));
    }

    #[test]
    fn test_shared_allocation_skips_thread_loops() {
        let h = Harness::pointwise_2d(64, 64);
        let ctx = h.ctx();
        let out = h.node("out");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, false, &ctx);
        let mut thread = (*root.children[0]).clone();
        thread.gpu_role = GpuRole::Thread;
        thread.store_at.insert(out);
        let thread = Arc::new(thread);
        assert_eq!(shared_mem_alloc_size(&thread, &thread, h.dag()), 0);
    }

    #[test]
    fn test_thread_local_allocation_over_local_limit() {
        let h = Harness::single_point_read(600_000);
        let root = h.block_with_producer("out", "f", true);
        assert_eq!(block_bytes(&h, &root), 0);
        assert!(exceeds_local_memory_limit(&root, &h.ctx()));
        assert_eq!(check(&root, &h.ctx()), Err(Infeasibility::LocalMemory));

        let small = Harness::single_point_read(64);
        let root = small.block_with_producer("out", "f", true);
        assert!(!exceeds_local_memory_limit(&root, &small.ctx()));
    }

    // 1024 vectors of out: serial tiles around the innermost loop, then 32
    // threads per block.
    #[test_case(16, Ok(()) ; "within the unroll limit")]
    #[test_case(17, Err(Infeasibility::SerialExtents) ; "beyond the unroll limit")]
    fn test_serial_loop_around_innermost(serial: i64, expected: Result<(), Infeasibility>) {
        let h = Harness::pointwise_1d(4096);
        let root = h.gpu_tiled(&[serial], &[32]);
        assert_eq!(check(&root, &h.ctx()), expected);
    }

    #[test]
    fn test_limits_come_from_the_target() {
        let h = Harness::pointwise_1d(4096).with_target(|t| t.unroll_limit = 32);
        let root = h.gpu_tiled(&[17], &[32]);
        assert!(!exceeds_serial_extents_limit(&root, &h.ctx()));

        let h = Harness::pointwise_1d(4096);
        let root = h.gpu_tiled(&[4], &[128]);
        assert!(root.has_valid_thread_extents(&h.ctx()));
        let narrow = Harness::pointwise_1d(4096).with_target(|t| t.max_threads_per_block = 64);
        let root = narrow.gpu_tiled(&[4], &[128]);
        assert!(!root.has_valid_thread_extents(&narrow.ctx()));
        assert_eq!(check(&root, &narrow.ctx()), Err(Infeasibility::InvalidThreadExtents));
    }

    #[test]
    fn test_store_at_depth() {
        let h = Harness::blur();
        let mut root = blocked_blur(&h);
        assert!(!contains_store_at_further_in_than_outermost(&root));

        let mut block = (*root.children[0]).clone();
        let mut inner = (*block.children[0]).clone();
        let mut leaf = (*inner.children[0]).clone();
        leaf.store_at.insert(h.node("blur_x"));
        inner.children[0] = Arc::new(leaf);
        block.children[0] = Arc::new(inner);
        root.children[0] = Arc::new(block);
        assert!(contains_store_at_further_in_than_outermost(&root));
    }
}
