//! Schedule decisions. Every edit builds new nodes and leaves the receiver
//! untouched, except `compute_here` and `inline_func`, which fill in a node
//! the caller has just cloned.

use std::sync::Arc;

use arbor_dag::{NodeId, Span};
use smallvec::SmallVec;

use super::tiling::generate_gpu_tilings;
use super::{GpuRole, LoopNest};
use crate::context::Context;

/// How `parallelize_in_tiles` reads its tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOptions {
    /// The tiling holds inner extents; otherwise it holds outer extents.
    pub inner_tiling: bool,
    /// Round the free side of every split so the tiles cover the loop evenly.
    pub adjust_tiling: bool,
    /// Keep reduction loops whole in the inner loop.
    pub move_all_rvars_inward: bool,
}

impl TileOptions {
    pub const fn inner(adjust_tiling: bool) -> Self {
        Self { inner_tiling: true, adjust_tiling, move_all_rvars_inward: true }
    }

    pub const fn outer(adjust_tiling: bool) -> Self {
        Self { inner_tiling: false, adjust_tiling, move_all_rvars_inward: true }
    }
}

impl Default for TileOptions {
    fn default() -> Self {
        Self::inner(true)
    }
}

impl LoopNest {
    /// Insert loops for every stage of `f` as the last children of this
    /// node, each covering the region of `f` required here with a
    /// single-vector leaf over dimension `v`.
    ///
    /// Returns true when the pure stage is not trivially small but its
    /// vectorized loop has extent one, i.e. vectorizing over `v` is pointless.
    pub fn compute_here(&mut self, f: NodeId, tileable: bool, v: usize, in_threads_loop: bool, ctx: &Context) -> bool {
        let dag = ctx.dag;
        let bounds = self.get_bounds(f, dag);
        let node = dag.node(f);
        let mut skip_vector_dim = false;

        for &sid in node.stages.iter().rev() {
            let stage = dag.stage(sid);
            let s = stage.index;
            let mut nest = LoopNest::for_stage(stage);
            nest.tileable = tileable;
            if ctx.has_gpu() {
                nest.gpu_role = if self.is_root() {
                    GpuRole::None
                } else if !in_threads_loop {
                    GpuRole::Thread
                } else {
                    GpuRole::Serial
                };
            }

            // Inside the new loop the required region is still the whole
            // region; its loops are one representative point.
            let mut single_point = (*bounds).clone();
            let mut vector_size = 1;
            let mut all_ones = true;
            for (i, lv) in stage.loops.iter().enumerate() {
                let l = bounds.loops[s][i];
                assert!(l.max() >= l.min(), "bounds invariant: loop {i} of {} is empty", stage.name);
                let mut size = l.extent();
                let mut point = Span::new(l.min(), l.min(), true);
                if node.dimensions() > 0 && size >= 1 && lv.pure_dim() == Some(v) {
                    nest.vectorized_loop_index = Some(i);
                    vector_size = stage.vector_size;
                    point.set_extent(vector_size);
                    size = (size + vector_size - 1) / vector_size;
                    // Use the middle vector as the representative one.
                    point.translate(vector_size * (size / 2));
                } else {
                    point.translate(size / 2);
                }
                single_point.loops[s][i] = point;
                nest.size.push(size);
                all_ones &= size == 1;
            }

            nest.vector_dim = Some(v);
            if s == 0 {
                skip_vector_dim = !all_ones && nest.size.get(v) == Some(&1);
            }

            let mut one_vector = LoopNest::for_stage(stage);
            one_vector.vectorized_loop_index = nest.vectorized_loop_index;
            one_vector.vector_dim = Some(v);
            one_vector.size = SmallVec::from_elem(1, stage.loops.len());
            one_vector.innermost = true;
            one_vector.gpu_role = GpuRole::Simd;
            let mut lane = single_point.clone();
            match nest.vectorized_loop_index {
                Some(vli) => {
                    lane.loops[s][vli].set_extent(1);
                    one_vector.size[vli] = vector_size;
                }
                None => assert!(
                    lane.loops[s].iter().all(|l| l.extent() == 1),
                    "bounds invariant: unvectorized single point of {} spans more than one point",
                    stage.name
                ),
            }
            one_vector.set_bounds(f, lane);

            nest.set_bounds(f, single_point);
            nest.children.push(Arc::new(one_vector));
            self.children.push(Arc::new(nest));
        }

        skip_vector_dim
    }

    /// Inline `f` into every innermost loop below this one that calls it.
    pub fn inline_func(&mut self, f: NodeId, ctx: &Context) {
        let dag = ctx.dag;
        for child in self.children.iter_mut() {
            if child.calls(f, dag) {
                let mut new_child = (**child).clone();
                new_child.inline_func(f, ctx);
                *child = Arc::new(new_child);
            }
        }

        if self.innermost {
            let mut calls = 0;
            for e in dag.outgoing(f) {
                let consumer = dag.stage(e.consumer);
                if let Some(c) = self.inlined.get(&consumer.node) {
                    calls += c * e.calls;
                }
                if Some(e.consumer) == self.stage {
                    calls += e.calls;
                }
            }
            if calls > 0 {
                self.inlined.insert(f, calls);
            }
        }
    }

    /// Split this loop into an outer and an inner loop according to
    /// `tiling`, indexed by pure dimension.
    ///
    /// On GPU targets the pair of roles follows from this loop's role: a
    /// compute-root loop becomes (`Parallelized`, `Serial`), a parallelized
    /// loop (`Block`, `Thread`), a thread loop (`Thread`, `Serial`) and a
    /// serial loop (`Serial`, `Serial`).
    pub fn parallelize_in_tiles(
        &self,
        tiling: &[i64],
        parent: &LoopNest,
        opts: TileOptions,
        ctx: &Context,
    ) -> Arc<LoopNest> {
        let dag = ctx.dag;
        let f = self.node_id();
        let stage = dag.stage(self.stage_id());

        let mut outer = LoopNest {
            node: self.node,
            stage: self.stage,
            vector_dim: self.vector_dim,
            vectorized_loop_index: self.vectorized_loop_index,
            ..LoopNest::root()
        };
        let mut inner = self.clone();
        inner.size = SmallVec::from_elem(1, self.size.len());
        inner.parallel = false;
        inner.gpu_role = GpuRole::None;

        if ctx.has_gpu() {
            let (outer_role, inner_role, parallel) = match self.gpu_role {
                GpuRole::None => (GpuRole::Parallelized, GpuRole::Serial, true),
                GpuRole::Parallelized => (GpuRole::Block, GpuRole::Thread, true),
                GpuRole::Thread => (GpuRole::Thread, GpuRole::Serial, false),
                GpuRole::Serial => (GpuRole::Serial, GpuRole::Serial, false),
                role => panic!("loop nest invariant: a {role} loop cannot be parallelized"),
            };
            outer.gpu_role = outer_role;
            inner.gpu_role = inner_role;
            outer.parallel = parallel;
        } else {
            outer.parallel = true;
        }
        outer.tileable = true;
        inner.tileable = self.tileable;
        outer.size = self.size.clone();

        let mut b = (*inner.get_bounds(f, dag)).clone();
        let parent_bounds = parent.get_bounds(f, dag);

        for (i, lv) in stage.loops.iter().enumerate() {
            let size = outer.size[i];
            let mut outer_extent;
            match lv.pure_dim() {
                Some(l) => {
                    let t = tiling[l];
                    if opts.inner_tiling {
                        outer_extent = (size + t - 1) / t;
                        inner.size[i] = t;
                    } else {
                        inner.size[i] = (size + t - 1) / t;
                        outer_extent = t;
                    }
                }
                None if opts.move_all_rvars_inward => {
                    outer_extent = 1;
                    inner.size[i] = size;
                }
                None => {
                    outer_extent = size;
                    inner.size[i] = 1;
                }
            }
            if opts.adjust_tiling {
                if opts.inner_tiling {
                    inner.size[i] = (size + outer_extent - 1) / outer_extent;
                } else {
                    outer_extent = (size + inner.size[i] - 1) / inner.size[i];
                }
            }
            outer.size[i] = outer_extent;

            let p = parent_bounds.loops[stage.index][i];
            let extent = inner.product_of_self_and_descendants(i);
            // Pick a representative inner iteration from the middle tile.
            let min = p.min() + (outer_extent / 2) * extent;
            b.loops[stage.index][i] = Span::new(min, min + extent - 1, p.constant_extent() || lv.is_pure());
        }
        outer.set_bounds(f, b);
        outer.children.push(Arc::new(inner));
        Arc::new(outer)
    }

    /// Every way to compute `f` somewhere inside this loop nest: here, or
    /// pushed into the single child that calls it.
    ///
    /// `v` is the storage dimension of `f` to vectorize. `in_realization`
    /// means this loop is already inside the realization of `f`'s storage.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_in_tiles(
        &self,
        f: NodeId,
        parent: Option<&LoopNest>,
        v: usize,
        in_realization: bool,
        in_threads_loop: bool,
        is_pre_pass: bool,
        union_counts: &[i64],
        ctx: &Context,
    ) -> Vec<Arc<LoopNest>> {
        let dag = ctx.dag;
        let node = dag.node(f);
        let options = &ctx.config.search_space;
        let mut result = Vec::new();

        if let Some(parent) = parent {
            let here = self.get_bounds(f, dag);
            let at_parent = parent.get_bounds(f, dag);
            // Don't descend into loops that break vectorization possible one
            // level up.
            let vector_size = dag.stage_of(f, 0).vector_size;
            let e = here.region_computed[v].extent();
            let ep = at_parent.region_computed[v].extent();
            if ep >= vector_size && e < vector_size {
                return result;
            }
            if !self.region_computed_shrinks(f, parent, dag) {
                return result;
            }
        }

        let mut child = None;
        let mut called_by_multiple_children = false;
        for (i, c) in self.children.iter().enumerate() {
            if c.calls(f, dag) {
                called_by_multiple_children |= child.is_some();
                child = Some(i);
            }
        }

        let union_counts =
            if self.is_gpu_block() { self.get_union_thread_counts(Some(f), dag) } else { union_counts.to_vec() };

        let is_block_level = !self.is_root() && !in_threads_loop;
        let can_compute_here = (self.is_root() && options.compute_root)
            || node.is_output
            || (is_block_level && options.compute_at_block)
            || (in_threads_loop && options.compute_at_thread);

        let vector_loop_is_one = match self.vector_dim {
            Some(vd) => self.size.get(vd).is_none_or(|s| *s == 1),
            None => true,
        };
        if !self.innermost && (!in_realization || vector_loop_is_one) && can_compute_here {
            let mut r = self.clone();
            r.compute_here(f, true, v, in_threads_loop, ctx);
            if !in_realization {
                r.store_at.insert(f);
            } else {
                r.tileable = false;
            }

            if !self.is_root() && !in_threads_loop && ctx.has_gpu() {
                // A thread loop inside a block: one child per thread tiling.
                if !r.add_gpu_thread_tilings(f, &union_counts, ctx, &mut result) {
                    result.push(Arc::new(r));
                }
            } else {
                result.push(Arc::new(r));
            }
        }

        let stop_here = (self.is_root() && !options.compute_at_block && !options.compute_at_thread)
            || (in_threads_loop && !options.compute_at_thread);
        if stop_here || node.is_output || is_pre_pass {
            return result;
        }

        if let Some(ci) = child
            && !called_by_multiple_children
            && !in_realization
        {
            let c = &self.children[ci];
            let all_ones = c.size.iter().all(|s| *s == 1);
            // Fusing into serial loops would leave f unparallelizable.
            if self.is_root() && all_ones && ctx.parallelism() > 1 {
                return result;
            }

            let in_threads_loop = in_threads_loop || c.is_gpu_thread();
            for n in c.compute_in_tiles(f, Some(self), v, false, in_threads_loop, false, &union_counts, ctx) {
                let mut r = self.clone();
                r.store_at.insert(f);
                r.children[ci] = n;
                result.push(Arc::new(r));
            }
        }

        result
    }

    /// Split the freshly inserted loops of `f` into (thread, serial) pairs
    /// for every legal thread tiling. Returns false, leaving the loops
    /// serial, when there is no legal tiling.
    fn add_gpu_thread_tilings(
        &mut self,
        f: NodeId,
        max_size: &[i64],
        ctx: &Context,
        result: &mut Vec<Arc<LoopNest>>,
    ) -> bool {
        let sizes = self.get_stage_sizes(f, ctx.dag);
        assert!(!sizes.sizes.is_empty(), "loop nest invariant: no stage of the inserted func");
        let d = sizes.sizes[0].len() as isize - 1;
        let tilings = generate_gpu_tilings(&sizes, max_size, d, true, false);

        for t in &tilings {
            let mut new_parent = self.clone();
            let parallelized: Vec<_> = new_parent
                .children
                .iter()
                .map(|c| if c.node == Some(f) { c.parallelize_in_tiles(t, &new_parent, TileOptions::outer(false), ctx) } else { c.clone() })
                .collect();
            new_parent.children = parallelized;
            result.push(Arc::new(new_parent));
        }

        if tilings.is_empty() {
            for c in self.children.iter_mut().filter(|c| c.node == Some(f)) {
                Arc::make_mut(c).gpu_role = GpuRole::Serial;
            }
        }
        !tilings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::test::helpers::*;

    use super::*;

    #[test]
    fn test_compute_here_builds_vector_leaf() {
        let h = Harness::pointwise_1d(1024);
        let ctx = h.ctx();
        let out = h.node("out");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, false, &ctx);
        assert_eq!(root.children.len(), 1);
        let nest = &root.children[0];
        // 1024 points in vectors of 4.
        assert_eq!(nest.size.as_slice(), &[256]);
        assert!(!nest.innermost);
        let leaf = &nest.children[0];
        assert!(leaf.innermost);
        assert_eq!(leaf.gpu_role, GpuRole::Simd);
        assert_eq!(leaf.size.as_slice(), &[4]);
        let b = leaf.get_bounds(out, h.dag());
        assert_eq!(b.loops[0][0].extent(), 1);
    }

    #[test]
    fn test_parallelize_in_tiles_roles_and_sizes() {
        let h = Harness::pointwise_1d(1024);
        let ctx = h.ctx();
        let out = h.node("out");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, false, &ctx);
        let nest = root.children[0].clone();

        let split = nest.parallelize_in_tiles(&[16], &root, TileOptions::inner(false), &ctx);
        assert_eq!(split.gpu_role, GpuRole::Parallelized);
        assert_eq!(split.size.as_slice(), &[16]);
        let inner = &split.children[0];
        assert_eq!(inner.gpu_role, GpuRole::Serial);
        assert_eq!(inner.size.as_slice(), &[16]);
        // The original node is not touched.
        assert_eq!(nest.size.as_slice(), &[256]);
    }

    #[test]
    fn test_inline_func_counts_calls() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let out = h.node("blur_y");
        let bx = h.node("blur_x");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, false, &ctx);
        root.store_at.insert(out);
        root.inline_func(bx, &ctx);
        let leaf = &root.children[0].children[0];
        assert_eq!(leaf.inlined.get(&bx), Some(&3));
        assert!(root.computes(bx));
    }

    #[test]
    fn test_compute_in_tiles_root_options() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let out = h.node("blur_y");
        let bx = h.node("blur_x");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, false, &ctx);
        root.store_at.insert(out);
        let options = root.compute_in_tiles(bx, None, 0, false, false, false, &[1, 1, 1], &ctx);
        assert!(!options.is_empty());
        // Computing at root adds a second root-level loop.
        assert!(options.iter().any(|o| o.children.len() == 2));
        for o in &options {
            assert!(o.computes(bx));
        }
    }
}
