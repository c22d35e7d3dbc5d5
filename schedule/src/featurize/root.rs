//! The loop nest the featurizer actually walks.
//!
//! Until phase 1 has split a compute-root func into blocks and threads its
//! features would be meaningless, so the featurizer works on a copy where
//! such loops get a provisional one-warp split, and where serial loops inside
//! a block gain a thread loop of extent one. Subtrees that need neither
//! rewrite are shared with the original tree and keep their feature memos.

use std::sync::Arc;

use crate::context::Context;
use crate::loop_nest::{GpuRole, LoopNest, TileOptions};

const PROVISIONAL_THREAD_EXTENT: i64 = 32;

/// Root to featurize in place of `root`.
pub fn root_for_features(root: &Arc<LoopNest>, ctx: &Context) -> Arc<LoopNest> {
    if !ctx.has_gpu() || (!has_compute_root_loops_without_blocks(root) && !has_loop_nest_without_thread_loops(root)) {
        return root.clone();
    }
    rewrite(root, ctx)
}

fn has_compute_root_loops_without_blocks(root: &LoopNest) -> bool {
    root.children.iter().any(|c| c.gpu_role == GpuRole::None)
}

fn has_loop_nest_without_thread_loops(root: &LoopNest) -> bool {
    root.children
        .iter()
        .filter(|c| c.is_gpu_block())
        .flat_map(|c| c.children.iter())
        .any(|c| !c.all_paths_to_leaves_have_thread_loop())
}

/// Bottom-up copy; a node is copied only when it or a descendant changes.
fn rewrite(nest: &Arc<LoopNest>, ctx: &Context) -> Arc<LoopNest> {
    let children: Vec<_> = nest.children.iter().map(|c| rewrite(c, ctx)).collect();
    let children_changed = children.iter().zip(&nest.children).any(|(a, b)| !Arc::ptr_eq(a, b));
    if !children_changed && !needs_rewrite(nest) {
        return nest.clone();
    }

    let mut copy = (**nest).clone();
    copy.children = children;
    if copy.is_root() {
        split_compute_root_loops(&mut copy, ctx);
    } else {
        add_outer_thread_loops(&mut copy, ctx);
    }
    Arc::new(copy)
}

fn needs_rewrite(nest: &LoopNest) -> bool {
    match nest.gpu_role {
        _ if nest.is_root() => nest.children.iter().any(|c| c.gpu_role == GpuRole::None && !c.size.is_empty()),
        GpuRole::Block => nest.children.iter().any(|c| !c.has_thread_loop_descendant()),
        GpuRole::Serial => {
            nest.children.iter().any(|c| c.has_thread_loop_descendant())
                && nest.children.iter().any(|c| !c.has_thread_loop_descendant())
        }
        _ => false,
    }
}

/// Split every unsplit compute-root loop into blocks and threads with (at
/// most) one warp along the vectorized loop.
fn split_compute_root_loops(root: &mut LoopNest, ctx: &Context) {
    let dag = ctx.dag;
    for i in (0..root.children.len()).rev() {
        let c = &root.children[i];
        if c.gpu_role != GpuRole::None || c.size.is_empty() {
            continue;
        }
        let stage = dag.stage(c.stage_id());
        let dims = dag.node(c.node_id()).dimensions();
        let vli = c.vectorized_loop_index;

        let split = if stage.index == 0 {
            let mut tiling = vec![1; dims];
            let parallelized = c.parallelize_in_tiles(&tiling, root, TileOptions::inner(false), ctx);
            if let Some(v) = vli {
                tiling[v] = parallelized.size[v].min(PROVISIONAL_THREAD_EXTENT);
            }
            parallelized.parallelize_in_tiles(&tiling, root, TileOptions::inner(false), ctx)
        } else {
            // Update stages tile by pure dimension; reduction loops move
            // inward and stay serial.
            let mut tiling = vec![1; dims];
            for (l, lv) in stage.loops.iter().enumerate() {
                if let Some(d) = lv.pure_dim() {
                    tiling[d] = c.size[l];
                }
            }
            let parallelized = c.parallelize_in_tiles(&tiling, root, TileOptions::outer(true), ctx);

            let mut thread_tiling = vec![1; dims];
            if let Some(v) = vli
                && let Some(d) = stage.loops[v].pure_dim()
            {
                thread_tiling[d] = parallelized.size[v].min(PROVISIONAL_THREAD_EXTENT);
            }
            parallelized.parallelize_in_tiles(&thread_tiling, root, TileOptions::inner(false), ctx)
        };
        root.children[i] = split;
    }
}

/// Wrap serial loops that run directly in a block, or next to thread loops
/// in a serial loop, in a thread loop of extent one.
fn add_outer_thread_loops(nest: &mut LoopNest, ctx: &Context) {
    match nest.gpu_role {
        GpuRole::Block => {}
        GpuRole::Serial if nest.children.iter().any(|c| c.has_thread_loop_descendant()) => {}
        _ => return,
    }

    for i in 0..nest.children.len() {
        let c = &nest.children[i];
        if c.has_thread_loop_descendant() {
            continue;
        }
        if nest.is_gpu_block() {
            assert!(c.is_gpu_serial(), "gpu invariant: a {} loop runs directly inside a block", c.gpu_role);
        }
        let tiling = vec![1; ctx.dag.node(c.node_id()).dimensions()];
        let mut as_thread = (**c).clone();
        as_thread.gpu_role = GpuRole::Thread;
        let wrapped = as_thread.parallelize_in_tiles(&tiling, nest, TileOptions::outer(true), ctx);
        nest.children[i] = wrapped;
    }
}

#[cfg(test)]
mod tests {
    use crate::test::helpers::*;

    use super::*;

    #[test]
    fn test_cpu_root_is_featurized_in_place() {
        let h = Harness::pointwise_1d(1024).with_cpu();
        let ctx = h.ctx();
        let root = Arc::new(h.compute_root_all());
        let feature_root = root_for_features(&root, &ctx);
        assert!(Arc::ptr_eq(&root, &feature_root));
    }

    #[test]
    fn test_compute_root_loop_gets_one_warp() {
        let h = Harness::pointwise_2d(1024, 1024);
        let ctx = h.ctx();
        let root = Arc::new(h.compute_root_all());
        let feature_root = root_for_features(&root, &ctx);
        assert!(!Arc::ptr_eq(&root, &feature_root));

        let block = &feature_root.children[0];
        assert!(block.is_gpu_block());
        let thread = &block.children[0];
        assert!(thread.is_gpu_thread());
        let vli = thread.vectorized_loop_index.unwrap();
        assert_eq!(thread.size[vli], 32);
        assert!(thread.size.iter().product::<i64>() <= 1024);
        assert!(feature_root.has_valid_thread_extents(&h.ctx()));
    }

    #[test]
    fn test_original_tree_is_untouched() {
        let h = Harness::pointwise_2d(256, 256);
        let ctx = h.ctx();
        let root = Arc::new(h.compute_root_all());
        let _ = root_for_features(&root, &ctx);
        assert_eq!(root.children[0].gpu_role, GpuRole::None);
    }
}
