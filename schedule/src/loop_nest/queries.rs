//! Read-only questions asked of a loop nest by the search, the feasibility
//! checks and the featurizer.

use std::collections::BTreeSet;

use arbor_dag::{FunctionDag, NodeId, StageId};
use smallvec::SmallVec;

use super::tiling::{StageSizes, are_valid_thread_extents, lowered_dims};
use super::{GpuRole, LoopNest};
use crate::context::Context;
use crate::target::Target;

// ============================================================================
// STRUCTURE
// ============================================================================

impl LoopNest {
    /// Does anything at or below this loop read `f`?
    pub fn calls(&self, f: NodeId, dag: &FunctionDag) -> bool {
        if self.children.iter().any(|c| c.calls(f, dag)) {
            return true;
        }
        dag.outgoing(f)
            .any(|e| Some(e.consumer) == self.stage || self.inlined.contains_key(&dag.stage(e.consumer).node))
    }

    /// Does this loop nest compute `f`, directly or inlined?
    pub fn computes(&self, f: NodeId) -> bool {
        self.node == Some(f) || self.inlined.contains_key(&f) || self.children.iter().any(|c| c.computes(f))
    }

    /// Largest inlined call count anywhere below.
    pub fn max_inlined_calls(&self) -> i64 {
        let here = self.inlined.values().copied().max().unwrap_or(0);
        self.children.iter().map(|c| c.max_inlined_calls()).fold(here, i64::max)
    }

    /// Does this loop nest, or a func inlined into it, read an input buffer?
    pub fn accesses_input_buffer(&self, dag: &FunctionDag) -> bool {
        if self.children.iter().any(|c| c.accesses_input_buffer(dag)) {
            return true;
        }
        let Some(stage) = self.stage else {
            return false;
        };
        let reads_input = |s: StageId| dag.incoming(s).any(|e| dag.node(e.producer).is_input);
        reads_input(stage) || self.inlined.keys().any(|n| reads_input(dag.node(*n).stages[0]))
    }

    /// Every func inlined into an innermost loop below this one.
    pub fn collect_all_inlined(&self, all_inlined: &mut BTreeSet<NodeId>) {
        if self.innermost {
            all_inlined.extend(self.inlined.keys().copied());
        }
        for c in &self.children {
            c.collect_all_inlined(all_inlined);
        }
    }

    /// Number of nested loops of other stages with a non-unit extent.
    pub fn num_serial_loops(&self) -> usize {
        self.num_serial_loops_excluding(self.stage)
    }

    fn num_serial_loops_excluding(&self, stage: Option<StageId>) -> usize {
        let mut count = 0;
        for c in self.children.iter().filter(|c| c.stage != stage) {
            if c.size.iter().any(|s| *s > 1) {
                count += 1;
            }
            count += c.num_serial_loops_excluding(stage);
        }
        count
    }

    pub fn producer_computed_here_or_further_in(&self, producer: NodeId) -> bool {
        self.children.iter().any(|c| c.node == Some(producer) || c.producer_computed_here_or_further_in(producer))
    }

    /// Does another stage of this loop's func read `producer`?
    pub fn other_stage_has_same_producer(&self, producer: NodeId, dag: &FunctionDag) -> bool {
        let this = self.stage_id();
        dag.node(self.node_id())
            .stages
            .iter()
            .filter(|s| **s != this)
            .any(|s| dag.incoming(*s).any(|e| e.producer == producer))
    }

    /// Root-level loop of the pure stage of `f`.
    pub fn find_pure_stage_loop_nest(&self, f: NodeId, dag: &FunctionDag) -> Option<&LoopNest> {
        for c in &self.children {
            if c.node == Some(f) {
                if dag.stage(c.stage_id()).index == 0 {
                    return Some(c);
                }
            } else if let Some(pure) = c.find_pure_stage_loop_nest(f, dag) {
                return Some(pure);
            }
        }
        None
    }

    /// Vectorized loop of this stage, falling back to the pure stage's and
    /// to loop 0 when the pure stage's index is out of range here.
    pub fn get_vectorized_loop_index_from_pure_stage(&self, root: &LoopNest, dag: &FunctionDag) -> usize {
        let v = self.vectorized_loop_index.or_else(|| {
            root.find_pure_stage_loop_nest(self.node_id(), dag).and_then(|p| p.vectorized_loop_index)
        });
        match v {
            Some(v) if v < self.size.len() => v,
            _ => 0,
        }
    }

    /// The innermost loop of this loop's func below it, and its parent.
    pub fn find_innermost_and_parent(&self) -> (&LoopNest, &LoopNest) {
        assert!(!self.innermost, "loop nest invariant: innermost loop has no inner loop");
        let mut parent = self;
        loop {
            let Some(child) = parent.children.iter().rev().find(|c| c.node == self.node) else {
                panic!("loop nest invariant: no innermost loop of {:?} below loop {}", self.node, self.id);
            };
            if child.innermost {
                return (child, parent);
            }
            parent = child;
        }
    }

    /// Sizes of the root-level loops of `f`, one entry per stage.
    pub fn get_stage_sizes(&self, f: NodeId, dag: &FunctionDag) -> StageSizes {
        let node = dag.node(f);
        let n = node.stages.len();
        let mut out =
            StageSizes { sizes: vec![Vec::new(); n], pure_dims: vec![Vec::new(); n], vectorized_indices: vec![None; n] };
        if node.dimensions() == 0 {
            return out;
        }
        for c in self.children.iter().filter(|c| c.node == Some(f)) {
            let stage = dag.stage(c.stage_id());
            out.vectorized_indices[stage.index] = c.vectorized_loop_index;
            out.sizes[stage.index] = c.size.to_vec();
            out.pure_dims[stage.index] = stage.loops.iter().map(|l| l.pure_dim()).collect();
        }
        out
    }

    /// Odd serial sizes for the vectorized loop that leave the remaining
    /// extent a multiple of a warp.
    pub fn generate_vec_dim_serial_tilings(&self, warp_size: i64) -> Vec<i64> {
        let Some(vli) = self.vectorized_loop_index else {
            return Vec::new();
        };
        let extent = self.size[vli];
        if extent % warp_size != 0 {
            return Vec::new();
        }
        let remaining = extent / warp_size;
        [3, 5, 7].into_iter().filter(|s| remaining % s == 0).collect()
    }
}

// ============================================================================
// GPU STRUCTURE
// ============================================================================

impl LoopNest {
    pub fn has_thread_loop_descendant(&self) -> bool {
        self.is_gpu_thread() || self.children.iter().any(|c| c.has_thread_loop_descendant())
    }

    pub fn all_paths_to_leaves_have_thread_loop(&self) -> bool {
        if self.is_gpu_thread() {
            return true;
        }
        !self.children.is_empty() && self.children.iter().all(|c| c.all_paths_to_leaves_have_thread_loop())
    }

    /// Per lowered dimension, the largest thread extent of any thread loop
    /// below this one, ignoring the loops of `f`.
    pub fn get_union_thread_counts(&self, f: Option<NodeId>, dag: &FunctionDag) -> Vec<i64> {
        let mut max_size = vec![1, 1, 1];
        let mut merge = |sizes: Vec<i64>| {
            for (dim, s) in sizes.into_iter().enumerate() {
                match max_size.get_mut(dim) {
                    Some(m) => *m = (*m).max(s),
                    None => max_size.push(s),
                }
            }
        };
        for c in self.children.iter().filter(|c| f.is_none() || c.node != f) {
            if c.is_gpu_thread() {
                merge(lowered_dims(&c.size, c.vectorized_loop_index));
            } else if !c.children.is_empty() {
                merge(c.get_union_thread_counts(f, dag));
            }
        }
        max_size
    }

    /// Every root-level loop's threads fit in one block.
    pub fn has_valid_thread_extents(&self, ctx: &Context) -> bool {
        let max_threads = ctx.target.max_threads_per_block;
        self.children
            .iter()
            .all(|c| are_valid_thread_extents(&c.get_union_thread_counts(None, ctx.dag), max_threads))
    }

    /// Grid size of `block`, packing lowered dimensions greedily into the
    /// three block dimensions.
    pub fn get_block_and_serial_extents(block: &LoopNest, target: &Target) -> (i64, i64) {
        let lowered = lowered_dims(&block.size, block.vectorized_loop_index);
        let mut block_extents = [1i64; 3];
        let mut total_block_extents = 1;
        let mut i = 0;
        let mut block_i = 0;
        while i < lowered.len() && block_i < 3 {
            if lowered[i] * block_extents[block_i] > target.max_blocks[block_i] {
                block_i += 1;
            } else {
                block_extents[block_i] *= lowered[i];
                total_block_extents *= lowered[i];
            }
            i += 1;
        }
        let serial_extents: i64 = lowered[i..].iter().product();
        assert_eq!(serial_extents, 1, "gpu invariant: block loop {} does not fit the grid", block.id);
        (total_block_extents, serial_extents)
    }

    /// Does any serial GPU loop iterate too many times? Serial loops directly
    /// around an innermost loop are held to the unroll limit.
    pub fn exceeds_serial_extents_limit(&self, ctx: &Context) -> bool {
        if self.is_gpu_serial() {
            let stage = ctx.dag.stage(self.stage_id());
            if stage.index == 0 {
                let extents: i64 = stage.loops.iter().filter_map(|l| l.pure_dim()).map(|d| self.size[d]).product();
                let parent_of_innermost = self.children.iter().any(|c| c.node == self.node && c.innermost);
                if parent_of_innermost {
                    return extents > ctx.target.unroll_limit;
                }
                if extents > ctx.target.max_serial_extents {
                    return true;
                }
            }
        }
        self.children.iter().any(|c| c.exceeds_serial_extents_limit(ctx))
    }

    /// Which loops of the innermost loop's stage get unrolled, judged from
    /// the extents at the grandparent.
    pub fn unrolled_loops(&self, parent: &LoopNest, grandparent: &LoopNest, ctx: &Context) -> Vec<bool> {
        let dag = ctx.dag;
        assert!(self.innermost, "loop nest invariant: unrolling is decided at innermost loops");
        let mut unrolled = vec![false; parent.size.len()];
        if parent.node != self.node {
            return unrolled;
        }
        let f = self.node_id();
        let stage = dag.stage(self.stage_id());
        let parent_stage = dag.stage(parent.stage_id());
        let gb = grandparent.get_bounds(f, dag);
        let mut total_extent = 1;
        for (i, u) in unrolled.iter_mut().enumerate() {
            if !stage.loops[i].is_rvar() {
                let l = gb.loops[parent_stage.index][i];
                *u = l.constant_extent();
                total_extent *= l.extent();
            }
        }
        if total_extent > ctx.target.unroll_limit {
            unrolled.fill(false);
        }
        unrolled
    }

    /// Largest idle lane fraction over every thread loop below.
    pub fn max_idle_lane_wastage<'a>(&'a self, mut info: GpuLoopInfo<'a>, ctx: &Context) -> f64 {
        info.update(self, ctx);
        if self.is_gpu_thread() {
            return info.create_thread_info(ctx).idle_lane_wastage();
        }
        self.children.iter().map(|c| c.max_idle_lane_wastage(info.clone(), ctx)).fold(0.0, f64::max)
    }
}

// ============================================================================
// ALLOCATIONS
// ============================================================================

impl LoopNest {
    /// Bytes of `f` allocated at this level and whether that size is static.
    pub fn compute_alloc_size_of_node_here(&self, f: NodeId, dag: &FunctionDag) -> (i64, bool) {
        let bounds = self.get_bounds(f, dag);
        let node = dag.node(f);
        let bytes = bounds.region_computed.iter().map(|p| p.extent()).product::<i64>() * node.bytes_per_point;
        (bytes, bounds.constant_region_computed())
    }

    pub fn has_constant_region_computed(&self, f: NodeId, dag: &FunctionDag) -> bool {
        self.get_bounds(f, dag).constant_region_computed()
    }

    pub fn has_constant_region_required(&self, f: NodeId, dag: &FunctionDag) -> bool {
        self.get_bounds(f, dag).region_required.iter().all(|s| s.constant_extent())
    }

    /// Is the computed region of `f` smaller here than at `parent`?
    pub fn region_computed_shrinks(&self, f: NodeId, parent: &LoopNest, dag: &FunctionDag) -> bool {
        self.get_bounds(f, dag).points_computed() < parent.get_bounds(f, dag).points_computed()
    }

    /// Bytes allocated inside thread loops below this one.
    pub fn get_total_local_mem_alloc_size(&self, constant_allocs_only: bool, in_threads_loop: bool, dag: &FunctionDag) -> i64 {
        let in_threads_loop = in_threads_loop || self.is_gpu_thread();
        let mut result = 0;
        if in_threads_loop {
            for &f in &self.store_at {
                if dag.node(f).dimensions() == 0 {
                    continue;
                }
                let (bytes, constant) = self.compute_alloc_size_of_node_here(f, dag);
                if !constant_allocs_only || constant {
                    result += bytes;
                }
            }
        }
        result
            + self
                .children
                .iter()
                .map(|c| c.get_total_local_mem_alloc_size(constant_allocs_only, in_threads_loop, dag))
                .sum::<i64>()
    }

    /// Does a func stored inside a thread loop have a dynamic size?
    pub fn has_dynamic_allocation_inside_thread(&self, in_thread_loop: bool, dag: &FunctionDag) -> bool {
        let in_thread_loop = in_thread_loop || self.is_gpu_thread();
        if in_thread_loop && self.store_at.iter().any(|f| !self.has_constant_region_computed(*f, dag)) {
            return true;
        }
        self.children.iter().any(|c| c.has_dynamic_allocation_inside_thread(in_thread_loop, dag))
    }
}

// ============================================================================
// THREAD GEOMETRY
// ============================================================================

/// Shape of the threads of one thread loop within its block.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    /// Union of thread extents of every thread loop in the block.
    pub threads_in_block: [i64; 3],
    pub num_threads_in_block: i64,
    /// Thread extents of this loop, vectorized loop first.
    pub threads: [i64; 3],
    pub num_threads: i64,
    /// Stage loops mapped onto thread dimensions.
    pub loop_indices: SmallVec<[usize; 3]>,
    pub num_warps_per_block: i64,
    pub num_active_threads: i64,
    pub num_active_warps_per_block: i64,
    warp_size: i64,
    max_threads_per_block: i64,
}

impl ThreadInfo {
    pub fn new(vectorized_loop_index: Option<usize>, size: &[i64], max_thread_counts: &[i64], target: &Target) -> Self {
        let (warp_size, max_threads_per_block) = (target.warp_size, target.max_threads_per_block);
        let mut threads_in_block = [1i64; 3];
        let mut num_threads_in_block = 1;
        let mut dims = 0;
        for &c in max_thread_counts.iter().filter(|c| **c != 1) {
            if dims >= 3 || num_threads_in_block * c > max_threads_per_block {
                break;
            }
            threads_in_block[dims] = c;
            num_threads_in_block *= c;
            dims += 1;
        }

        let mut threads = [1i64; 3];
        let mut num_threads = 1;
        let mut loop_indices = SmallVec::new();
        if let Some(v) = vectorized_loop_index
            && size.get(v).is_some_and(|s| *s != 1)
        {
            threads[0] = size[v];
            num_threads = size[v];
            loop_indices.push(v);
        }
        for (i, &s) in size.iter().enumerate() {
            if loop_indices.len() >= 3 {
                break;
            }
            if s == 1 || Some(i) == vectorized_loop_index {
                continue;
            }
            if num_threads * s > max_threads_per_block {
                break;
            }
            threads[loop_indices.len()] = s;
            num_threads *= s;
            loop_indices.push(i);
        }
        if loop_indices.is_empty() {
            loop_indices.push(0);
        }

        // A loop never has more threads than its block.
        for d in 0..3 {
            threads_in_block[d] = threads_in_block[d].max(threads[d]);
        }
        num_threads_in_block = threads_in_block.iter().product();
        let num_warps_per_block = (num_threads_in_block + warp_size - 1) / warp_size;

        let mut info = Self {
            threads_in_block,
            num_threads_in_block,
            threads,
            num_threads,
            loop_indices,
            num_warps_per_block,
            num_active_threads: 0,
            num_active_warps_per_block: 0,
            warp_size,
            max_threads_per_block,
        };
        info.count_active_warps();
        info
    }

    /// Walk the block in thread-id order; a warp is active when any of its
    /// lanes maps onto an iteration of this loop.
    fn count_active_warps(&mut self) {
        let [bx, by, bz] = self.threads_in_block;
        let mut id = 0;
        let mut last_active_warp = -1;
        for z in 0..bz {
            for y in 0..by {
                for x in 0..bx {
                    if x < self.threads[0] && y < self.threads[1] && z < self.threads[2] {
                        self.num_active_threads += 1;
                        let warp = id / self.warp_size;
                        if warp != last_active_warp {
                            self.num_active_warps_per_block += 1;
                            last_active_warp = warp;
                        }
                    }
                    id += 1;
                }
            }
        }
    }

    pub fn warp_lane_utilization(&self) -> f64 {
        self.num_active_threads as f64 / (self.num_active_warps_per_block * self.warp_size) as f64
    }

    /// Fraction of lanes in active warps with nothing to do.
    pub fn idle_lane_wastage(&self) -> f64 {
        let lanes = (self.num_active_warps_per_block * self.warp_size) as f64;
        (lanes - self.num_active_threads as f64) / lanes
    }

    pub fn block_occupancy(&self) -> f64 {
        self.num_threads as f64 / self.max_threads_per_block as f64
    }

    /// Utilization of the y and z block dimensions.
    pub fn warp_lane_utilization_at_block(&self, dim: usize) -> f64 {
        self.threads[dim] as f64 / self.threads_in_block[dim] as f64
    }
}

/// GPU context accumulated on the way down the tree: the enclosing block and
/// thread loops and the serial extents around them.
#[derive(Debug, Clone)]
pub struct GpuLoopInfo<'a> {
    pub current_block_loop: Option<&'a LoopNest>,
    pub current_thread_loop: Option<&'a LoopNest>,
    pub num_blocks: i64,
    pub total_outer_serial_extents: i64,
    pub total_inner_serial_extents: i64,
    /// Serial loops between the thread loop and the current loop.
    pub inner_loop_stack: Vec<&'a LoopNest>,
    pub thread_info: Option<ThreadInfo>,
}

impl Default for GpuLoopInfo<'_> {
    fn default() -> Self {
        Self {
            current_block_loop: None,
            current_thread_loop: None,
            num_blocks: 1,
            total_outer_serial_extents: 1,
            total_inner_serial_extents: 1,
            inner_loop_stack: Vec::new(),
            thread_info: None,
        }
    }
}

impl<'a> GpuLoopInfo<'a> {
    pub fn update(&mut self, l: &'a LoopNest, ctx: &Context) {
        match l.gpu_role {
            GpuRole::Block => {
                self.current_block_loop = Some(l);
                self.num_blocks = LoopNest::get_block_and_serial_extents(l, ctx.target).0;
            }
            GpuRole::Thread => self.current_thread_loop = Some(l),
            GpuRole::Serial if self.at_or_inside_block() => {
                let extents: i64 = l.size.iter().product();
                if self.at_or_inside_thread() {
                    self.total_inner_serial_extents *= extents;
                    self.inner_loop_stack.push(l);
                } else {
                    self.total_outer_serial_extents *= extents;
                }
            }
            _ => {}
        }
    }

    pub fn at_or_inside_block(&self) -> bool {
        self.current_block_loop.is_some()
    }

    pub fn at_or_inside_thread(&self) -> bool {
        self.current_thread_loop.is_some()
    }

    pub fn total_serial_extents(&self) -> i64 {
        self.total_outer_serial_extents * self.total_inner_serial_extents
    }

    /// Build the thread geometry of the current thread loop.
    pub fn create_thread_info(&mut self, ctx: &Context) -> ThreadInfo {
        let Some(thread) = self.current_thread_loop else {
            panic!("gpu invariant: thread geometry requested outside a thread loop");
        };
        let max_thread_counts = match self.current_block_loop {
            Some(block) => block.get_union_thread_counts(None, ctx.dag),
            None => lowered_dims(&thread.size, thread.vectorized_loop_index),
        };
        let info = ThreadInfo::new(thread.vectorized_loop_index, &thread.size, &max_thread_counts, ctx.target);
        self.thread_info = Some(info.clone());
        info
    }
}
