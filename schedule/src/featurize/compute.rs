//! The feature walk.
//!
//! One pre-order pass over the feature root: store levels record realization
//! counts, task and production levels record footprints and working sets, and
//! innermost loops record loads, GPU occupancy and the contributions of the
//! funcs inlined into them.

use std::collections::BTreeSet;

use arbor_dag::{DimFootprint, Edge, NodeId, Stage, StageId, StageMap};
use smallvec::SmallVec;

use super::sites::{MemoryType, SiteMap, collect_stages};
use super::{
    FeatureIntermediates, FeatureMemo, FeatureStats, InlinedIntermediates, ScheduleFeatures, apply_intermediates,
    merge_intermediates,
};
use crate::context::Context;
use crate::loop_nest::{GpuLoopInfo, LoopNest, ThreadInfo};

const GLOBAL_SECTOR_BYTES: i64 = 32;
const SHARED_BANKS: i64 = 32;
const SHARED_BANK_BYTES: i64 = 4;

// ============================================================================
// ACCUMULATORS
// ============================================================================

/// One value per memory a producer can be loaded from.
#[derive(Debug, Default, Clone, Copy)]
struct ByMemory {
    global: i64,
    shared: i64,
    registers: i64,
}

impl ByMemory {
    fn add(&mut self, memory: MemoryType, value: i64) {
        match memory {
            MemoryType::Global => self.global += value,
            MemoryType::Shared => self.shared += value,
            MemoryType::Registers => self.registers += value,
            MemoryType::Local => {}
            MemoryType::Inlined => panic!("site invariant: footprint taken of an inlined func"),
        }
    }

    fn total(&self) -> i64 {
        self.global + self.shared + self.registers
    }
}

/// Transactions issued by a block and the bytes they move.
#[derive(Debug, Default, Clone, Copy)]
struct MemInfo {
    transactions: f64,
    bytes_used: f64,
    bytes_moved: f64,
}

impl MemInfo {
    fn add(&mut self, request: Request, requests: f64) {
        self.transactions += request.transactions as f64 * requests;
        self.bytes_used += request.bytes_used as f64 * requests;
        self.bytes_moved += request.bytes_moved as f64 * requests;
    }

    fn efficiency(&self) -> f64 {
        if self.bytes_moved <= 0.0 { 1.0 } else { (self.bytes_used / self.bytes_moved).min(1.0) }
    }
}

/// Cost of one warp-wide access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Request {
    transactions: i64,
    bytes_used: i64,
    bytes_moved: i64,
}

/// Global memory moves 32-byte sectors; `stride` is the distance in elements
/// between adjacent lanes, `None` when lanes walk a non-innermost dimension.
fn global_request(stride: Option<i64>, bytes_per_point: i64, lanes: i64) -> Request {
    let lanes = lanes.max(1);
    let sectors_per_lane = (bytes_per_point + GLOBAL_SECTOR_BYTES - 1) / GLOBAL_SECTOR_BYTES;
    let transactions = match stride {
        None => lanes * sectors_per_lane,
        Some(0) => sectors_per_lane,
        Some(s) => {
            let span = lanes * s * bytes_per_point;
            ((span + GLOBAL_SECTOR_BYTES - 1) / GLOBAL_SECTOR_BYTES).min(lanes * sectors_per_lane)
        }
    };
    let bytes_used = if stride == Some(0) { bytes_per_point } else { lanes * bytes_per_point };
    Request { transactions, bytes_used, bytes_moved: transactions * GLOBAL_SECTOR_BYTES }
}

/// Shared memory serves a warp in one wavefront unless lanes collide on a
/// bank.
fn shared_request(stride: Option<i64>, bytes_per_point: i64, lanes: i64) -> Request {
    let lanes = lanes.max(1);
    let (conflicts, bytes_used) = match stride {
        None => (lanes, lanes * bytes_per_point),
        Some(0) => (1, bytes_per_point),
        Some(s) => {
            let word_stride = (s * bytes_per_point / SHARED_BANK_BYTES).max(1);
            (gcd(word_stride, SHARED_BANKS).min(lanes), lanes * bytes_per_point)
        }
    };
    Request { transactions: conflicts, bytes_used, bytes_moved: bytes_used * conflicts }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Per producer dimension, the consumer loop its index moves with and the
/// scale; `None` for dimensions read at a fixed index.
type AccessMap = SmallVec<[Option<(usize, i64)>; 4]>;

#[derive(Debug, Clone)]
struct Access {
    producer: NodeId,
    map: AccessMap,
    calls: i64,
}

fn direct_access(e: &Edge) -> AccessMap {
    e.footprint
        .iter()
        .map(|fp| match *fp {
            DimFootprint::Affine { loop_index, scale, .. } if scale != 0 => Some((loop_index, scale)),
            _ => None,
        })
        .collect()
}

/// Access of `e.producer` through a func inlined into the consumer, where
/// `via` is how the consumer reads the inlined func.
fn composed_access(via: &AccessMap, e: &Edge, inlined_stage: &Stage) -> AccessMap {
    e.footprint
        .iter()
        .map(|fp| match *fp {
            DimFootprint::Affine { loop_index, scale, .. } if scale != 0 => inlined_stage.loops[loop_index]
                .pure_dim()
                .and_then(|d| via.get(d).copied().flatten())
                .map(|(l, s)| (l, s * scale)),
            _ => None,
        })
        .collect()
}

/// Elements between adjacent lanes along storage dimension
/// `innermost_dim`, when lanes advance loop `x`.
fn lane_stride(map: &AccessMap, innermost_dim: usize, x: usize) -> Option<i64> {
    let mut stride = 0;
    for (dim, m) in map.iter().enumerate() {
        if let Some((l, s)) = *m
            && l == x
        {
            if dim != innermost_dim {
                return None;
            }
            stride = s.abs();
        }
    }
    Some(stride)
}

/// Region of a producer touched at one site, in bytes and cache lines.
#[derive(Debug, Clone, Copy)]
struct Footprint {
    bytes: i64,
    lines: i64,
    max_extent: i64,
}

impl Footprint {
    fn new(bytes_per_point: i64) -> Self {
        Self { bytes: bytes_per_point, lines: 1, max_extent: 1 }
    }

    fn add(&mut self, extent: i64, dense: bool) {
        self.max_extent = self.max_extent.max(extent);
        self.bytes *= extent;
        if !dense {
            self.lines *= extent;
        }
    }

    /// Without a layout, assume the best one.
    fn assume_best_layout(&mut self) {
        self.lines /= self.max_extent;
    }
}

#[derive(Debug, Default)]
struct Loads {
    bytes: ByMemory,
    lines: ByMemory,
    bytes_per_thread: ByMemory,
    lines_per_thread: ByMemory,
    allocation_bytes: ByMemory,
}

// ============================================================================
// WALK
// ============================================================================

pub(super) struct FeatureWalk<'a, 'c> {
    ctx: &'c Context<'c>,
    sites: &'c SiteMap<'a>,
    root: &'a LoopNest,
    use_memoized: bool,
    features: StageMap<ScheduleFeatures>,
    /// Inlined contributions of the root-level loop nest being walked.
    intermediates: InlinedIntermediates,
    stats: FeatureStats,
}

impl<'a, 'c> FeatureWalk<'a, 'c> {
    pub(super) fn new(ctx: &'c Context<'c>, sites: &'c SiteMap<'a>, root: &'a LoopNest, use_memoized: bool) -> Self {
        Self {
            ctx,
            sites,
            root,
            use_memoized,
            features: StageMap::new(),
            intermediates: InlinedIntermediates::new(),
            stats: FeatureStats::default(),
        }
    }

    fn feat(&mut self, s: StageId) -> &mut ScheduleFeatures {
        self.features.entry(s).or_default()
    }

    fn stage0(&self, f: NodeId) -> StageId {
        self.ctx.dag.node(f).stages[0]
    }

    pub(super) fn run(mut self) -> (StageMap<ScheduleFeatures>, FeatureStats) {
        let root = self.root;
        self.record_realizations(root, 1);

        let mut working_set_here = 0;
        let mut all_intermediates = InlinedIntermediates::new();
        for c in &root.children {
            let hash = self.sites.get(c.stage_id()).hash_of_producers_stored_at_root;
            if self.use_memoized {
                if let Some(memo) = c.memoized_features(hash) {
                    self.stats.memo_hits += 1;
                    self.features.extend(memo.features.iter().map(|(s, f)| (*s, *f)));
                    merge_intermediates(&mut all_intermediates, &memo.intermediates);
                    working_set_here += memo.working_set;
                    continue;
                }
                self.stats.memo_misses += 1;
            }

            let mut working_set = 0;
            self.visit(c, 1, 1, root, None, GpuLoopInfo::default(), &mut working_set);
            let intermediates = std::mem::take(&mut self.intermediates);
            if self.use_memoized {
                let mut stages = Vec::new();
                collect_stages(c, &mut stages);
                let features = stages.into_iter().filter_map(|s| self.features.get(&s).map(|f| (s, *f))).collect();
                c.memoize_features(hash, FeatureMemo { features, intermediates: intermediates.clone(), working_set });
            }
            merge_intermediates(&mut all_intermediates, &intermediates);
            working_set_here += working_set;
        }
        self.close_working_set(root, &mut working_set_here);

        apply_intermediates(&mut self.features, &all_intermediates);
        self.root_features(working_set_here);
        (self.features, self.stats)
    }

    /// Features that depend only on the root: footprints of whole funcs and
    /// the cheapest point count any schedule could reach.
    fn root_features(&mut self, working_set: i64) {
        let dag = self.ctx.dag;
        for (&s, feat) in self.features.iter_mut() {
            let stage = dag.stage(s);
            let node = dag.node(stage.node);
            let root_bounds = self.root.get_bounds(node.id, dag);

            feat.bytes_at_root =
                (node.bytes_per_point * root_bounds.region_computed.iter().map(|p| p.extent()).product::<i64>()) as f64;
            feat.working_set_at_root = working_set as f64;
            feat.innermost_bytes_at_root = match self.sites.get(s).produce {
                Some(p) => {
                    let extent = p
                        .vector_dim
                        .filter(|v| *v < node.dimensions())
                        .map_or(1, |v| root_bounds.region_computed[v].extent());
                    (node.bytes_per_point * extent) as f64
                }
                None => 0.0,
            };
            feat.points_computed_minimum =
                root_bounds.loops[stage.index].iter().map(|l| l.extent()).product::<i64>() as f64;
        }

        // Consumers have lower stage ids, so their minimum is final by the
        // time a producer asks for it.
        let stages: Vec<StageId> = self.features.keys().copied().collect();
        for s in stages {
            let node = dag.node_of(s);
            if node.stages.len() != 1 || node.is_output {
                continue;
            }
            let if_inlined: f64 = dag
                .outgoing(node.id)
                .map(|e| self.features.get(&e.consumer).map_or(0.0, |f| f.points_computed_minimum) * e.calls as f64)
                .sum();
            let feat = self.feat(s);
            feat.points_computed_minimum = feat.points_computed_minimum.min(if_inlined);
        }
    }

    /// Realization features of every func stored at `nest`.
    fn record_realizations(&mut self, nest: &'a LoopNest, subinstances: i64) {
        let dag = self.ctx.dag;
        for &f in &nest.store_at {
            let node = dag.node(f);
            assert!(!node.is_input, "loop nest invariant: input {} is stored in the loop nest", node.name);
            let bounds = nest.get_bounds(f, dag);
            let memory = self.sites.of_node(f, self.ctx).memory_type;
            for &sid in &node.stages {
                let stage = dag.stage(sid);
                let produce = self.sites.get(sid).produce;
                let vectorized_loop = produce.and_then(|p| p.vectorized_loop_index);
                let vector_dim = produce.and_then(|p| p.vector_dim);

                let mut points = 1;
                let mut scalars = subinstances;
                for (i, l) in bounds.loops[stage.index].iter().enumerate() {
                    let extent = l.extent();
                    points *= extent;
                    // Only the tail of a vectorized loop runs as scalars.
                    scalars *= if Some(i) == vectorized_loop { extent % stage.vector_size } else { extent };
                }
                let bytes = node.bytes_per_point * bounds.points_computed();
                let innermost_extent = vector_dim
                    .filter(|_| node.dimensions() > 0)
                    .map_or(1, |v| bounds.region_computed[v].extent());

                let feat = self.feat(sid);
                feat.num_realizations = subinstances as f64;
                feat.points_computed_per_realization = points as f64;
                feat.num_scalars = scalars as f64;
                feat.points_computed_total = (points * subinstances) as f64;
                feat.bytes_at_realization = bytes as f64;
                feat.innermost_bytes_at_realization = (node.bytes_per_point * innermost_extent) as f64;

                if !nest.is_root() {
                    match memory {
                        MemoryType::Global => {
                            feat.global_bytes_at_task = feat.bytes_at_realization;
                            feat.global_innermost_bytes_at_task = feat.innermost_bytes_at_realization;
                        }
                        MemoryType::Shared => {
                            feat.shared_bytes_at_task = feat.bytes_at_realization;
                            feat.shared_innermost_bytes_at_task = feat.innermost_bytes_at_realization;
                        }
                        MemoryType::Registers => {
                            feat.register_bytes_at_task = feat.bytes_at_realization;
                            feat.register_innermost_bytes_at_task = feat.innermost_bytes_at_realization;
                        }
                        MemoryType::Local => {}
                        MemoryType::Inlined => panic!("site invariant: inlined func {} has storage", node.name),
                    }
                }
            }
        }
    }

    /// Add the funcs stored at `nest` to its working set and publish it.
    fn close_working_set(&mut self, nest: &LoopNest, working_set_here: &mut i64) {
        let dag = self.ctx.dag;
        for &f in &nest.store_at {
            *working_set_here += self.feat(self.stage0(f)).bytes_at_production as i64;
        }
        for &f in &nest.store_at {
            for &s in &dag.node(f).stages {
                self.feat(s).working_set_at_realization = *working_set_here as f64;
            }
        }
        for c in nest.children.iter().filter(|c| c.node != nest.node) {
            self.feat(c.stage_id()).working_set_at_production = *working_set_here as f64;
        }
    }

    fn set_working_set_at_task(&mut self, nest: &LoopNest, working_set: i64) {
        for c in &nest.children {
            self.set_working_set_at_task(c, working_set);
            self.feat(c.stage_id()).working_set_at_task = working_set as f64;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        nest: &'a LoopNest,
        instances: i64,
        parallelism: i64,
        parent: &'a LoopNest,
        grandparent: Option<&'a LoopNest>,
        mut gpu: GpuLoopInfo<'a>,
        working_set: &mut i64,
    ) {
        let ctx = self.ctx;
        let dag = ctx.dag;
        gpu.update(nest, ctx);
        if nest.is_gpu_thread() {
            gpu.create_thread_info(ctx);
        }

        let stage = dag.stage(nest.stage_id());
        let node = dag.node(stage.node);
        assert!(!node.is_input, "loop nest invariant: input {} has loops", node.name);
        let p = ctx.parallelism();

        let mut loop_instances = 1;
        let mut parallel_tasks = 1;
        let mut in_impure = false;
        for (idx, &extent) in nest.size.iter().enumerate().rev() {
            loop_instances *= extent;
            if stage.loops[idx].is_pure() && !in_impure {
                if p > 1 && (nest.parallel || (parent.is_root() && parallel_tasks < p)) {
                    parallel_tasks *= extent;
                    // An undecided tiling is assumed to target 8 tasks per core.
                    if !nest.parallel && parallel_tasks > p * 8 {
                        parallel_tasks = p * 8;
                    }
                }
            } else if extent != 1 {
                in_impure = true;
            }
        }
        let subinstances = instances * loop_instances;
        self.record_realizations(nest, subinstances);
        let subparallelism = parallel_tasks * parallelism;

        if !nest.innermost {
            let feat = self.feat(stage.id);
            feat.innermost_loop_extent = nest.size.iter().product::<i64>() as f64;
            feat.innermost_pure_loop_extent = nest
                .size
                .iter()
                .zip(&stage.loops)
                .filter(|(_, l)| !l.is_rvar())
                .map(|(s, _)| *s)
                .product::<i64>() as f64;
        }

        let at_task = parent.is_root();
        let at_production = parent.node != nest.node;
        let at_pure_production = at_production && stage.index == 0;

        if at_task {
            self.task_features(nest, stage);
        }

        if at_production {
            let bounds = parent.get_bounds(node.id, dag);
            let innermost_extent = nest
                .vector_dim
                .filter(|_| node.dimensions() > 0)
                .map_or(1, |v| bounds.region_computed[v].extent());
            let feat = self.feat(stage.id);
            feat.num_productions = instances as f64;
            feat.inner_parallelism = parallel_tasks as f64;
            feat.outer_parallelism = parallelism as f64;
            feat.bytes_at_production = (node.bytes_per_point * bounds.points_computed()) as f64;
            feat.innermost_bytes_at_production = (node.bytes_per_point * innermost_extent) as f64;
        }

        let mut working_set_here = 0;
        for c in &nest.children {
            self.visit(c, subinstances, subparallelism, nest, Some(parent), gpu.clone(), &mut working_set_here);
        }
        self.close_working_set(nest, &mut working_set_here);

        {
            let feat = self.feat(stage.id);
            if nest.is_gpu_thread() {
                feat.working_set_at_thread = working_set_here as f64;
            }
            if at_production {
                feat.working_set = working_set_here as f64;
            }
        }
        if at_task {
            self.set_working_set_at_task(nest, working_set_here);
        }

        if nest.innermost {
            let unroll_limit = ctx.target.unroll_limit as f64;
            let pure_extent = self.feat(stage.id).innermost_pure_loop_extent;
            let unrolled = pure_extent <= unroll_limit
                && parent.node == nest.node
                && grandparent.is_some_and(|gp| nest.unrolled_loops(parent, gp, ctx).iter().all(|u| *u));
            let branching = stage.incoming_edges.len()
                + nest.inlined.keys().map(|f| dag.stage(self.stage0(*f)).incoming_edges.len()).sum::<usize>();
            let feat = self.feat(stage.id);
            feat.unrolled_loop_extent = if unrolled { pure_extent } else { 1.0 };
            feat.expr_branching = branching as f64;
        }

        *working_set += working_set_here;

        if nest.innermost || at_production {
            self.load_features(nest, stage, parent, instances, subinstances, &gpu, at_production, at_pure_production);
        }

        self.inlined_features(nest, stage, subinstances, parallelism, &gpu);

        if nest.is_gpu_block() {
            self.shared_mem_occupancy(stage.id);
        }

        if nest.innermost
            && !nest.size.is_empty()
            && let Some(info) = &gpu.thread_info
        {
            let num_blocks = gpu.num_blocks;
            let has_block_loop = gpu.current_block_loop.is_some_and(|b| b.node == nest.node);
            let gpu_params = &ctx.config.gpu;
            let feat = self.feat(stage.id);
            warp_features(feat, info, num_blocks);
            if has_block_loop {
                warp_and_block_occupancy(feat, info, num_blocks, p, gpu_params.active_block_limit, gpu_params.active_warp_limit);
            }
        }
    }

    /// Bytes of the stage's own func and of every root-level producer one
    /// parallel task touches.
    fn task_features(&mut self, nest: &'a LoopNest, stage: &Stage) {
        let ctx = self.ctx;
        let dag = ctx.dag;
        let sites = self.sites;
        let node = dag.node(stage.node);
        let p = ctx.parallelism() as f64;

        let (bytes_at_task, innermost_bytes_at_task) = if nest.parallel {
            let bounds = nest.get_bounds(node.id, dag);
            let mut bytes = node.bytes_per_point as f64;
            let mut innermost_extent = 1;
            for i in 0..node.dimensions() {
                let outer = stage.loops.iter().position(|l| l.pure_dim() == Some(i)).map_or(1, |l| nest.size[l]);
                let extent = bounds.region_computed[i].extent() / outer;
                bytes *= extent as f64;
                if nest.vector_dim == Some(i) {
                    innermost_extent = extent;
                }
            }
            (bytes, (node.bytes_per_point * innermost_extent) as f64)
        } else {
            // The parallel split is not decided yet; assume an even one.
            let feat = self.feat(stage.id);
            let bytes = ((feat.bytes_at_realization + p - 1.0) / p).floor();
            (bytes, bytes.min(feat.innermost_bytes_at_realization))
        };

        let mut bytes_read = 0;
        let mut lines_read = 0;
        let mut pending: Vec<&Edge> = dag.incoming(stage.id).collect();
        let mut done = BTreeSet::new();
        while let Some(e) = pending.pop() {
            if !done.insert(e.producer) {
                continue;
            }
            let producer = dag.node(e.producer);
            let site = sites.of_node(e.producer, ctx);
            if site.store().is_root() {
                let b = nest.get_bounds(e.producer, dag);
                let vector_dim = if producer.is_input { Some(0) } else { site.produce.and_then(|l| l.vector_dim) };
                let mut fp = Footprint::new(producer.bytes_per_point);
                for (i, r) in b.region_required.iter().enumerate() {
                    fp.add(r.extent(), Some(i) == vector_dim);
                }
                if !producer.is_input && !site.is_scheduled() {
                    fp.assume_best_layout();
                }
                bytes_read += fp.bytes;
                lines_read += fp.lines;
            } else if site.is_scheduled() {
                // Computed inside this task or inlined into it.
                for &s in &producer.stages {
                    pending.extend(dag.incoming(s));
                }
            }
        }

        let memory = sites.of_node(node.id, ctx).memory_type;
        let feat = self.feat(stage.id);
        match memory {
            MemoryType::Global => {
                feat.global_bytes_at_task = bytes_at_task;
                feat.global_innermost_bytes_at_task = innermost_bytes_at_task;
            }
            MemoryType::Shared => {
                feat.shared_bytes_at_task = bytes_at_task;
                feat.shared_innermost_bytes_at_task = innermost_bytes_at_task;
            }
            MemoryType::Local | MemoryType::Registers => {}
            MemoryType::Inlined => panic!("site invariant: inlined func {} has a task", node.name),
        }
        feat.unique_bytes_read_per_task = bytes_read as f64;
        feat.unique_lines_read_per_task = lines_read as f64;
    }

    /// Loads of every producer of the stage, looking through inlined funcs.
    #[allow(clippy::too_many_arguments)]
    fn load_features(
        &mut self,
        nest: &'a LoopNest,
        stage: &Stage,
        parent: &'a LoopNest,
        instances: i64,
        subinstances: i64,
        gpu: &GpuLoopInfo<'a>,
        at_production: bool,
        at_pure_production: bool,
    ) {
        let ctx = self.ctx;
        let dag = ctx.dag;
        let sites = self.sites;
        let node = dag.node(stage.node);
        let consumer_site = sites.get(stage.id);
        let consumer_store_site = if nest.innermost { parent } else { consumer_site.store() };
        let Some(consumer_task_site) = consumer_site.task else {
            panic!("site invariant: stage {} runs outside any task", stage.name);
        };
        let consumer_instances = if nest.innermost { instances } else { self.feat(stage.id).num_realizations as i64 };
        assert!(consumer_instances != 0, "feature invariant: {} is never realized", stage.name);

        let mut loads = Loads::default();
        let mut accesses: Vec<Access> = Vec::new();
        let mut pending = vec![stage.id];
        let mut done = BTreeSet::new();
        while let Some(s) = pending.pop() {
            for e in dag.incoming(s) {
                let producer = dag.node(e.producer);
                let site = sites.of_node(e.producer, ctx);
                let scheduled = producer.is_input || site.is_scheduled();

                if nest.innermost {
                    if e.consumer == stage.id {
                        accesses.push(Access { producer: e.producer, map: direct_access(e), calls: e.calls });
                    } else {
                        let via = dag.stage(e.consumer);
                        let composed: Vec<Access> = accesses
                            .iter()
                            .filter(|a| a.producer == via.node)
                            .map(|a| Access {
                                producer: e.producer,
                                map: composed_access(&a.map, e, via),
                                calls: a.calls * e.calls,
                            })
                            .collect();
                        accesses.extend(composed);
                    }
                }

                if !done.insert(e.producer) {
                    continue;
                }
                if site.inlined {
                    pending.push(producer.stages[0]);
                    continue;
                }

                let bounds = consumer_store_site.get_bounds(e.producer, dag);
                let task_bounds = consumer_task_site.get_bounds(e.producer, dag);
                let compute_bounds = site.compute().get_bounds(e.producer, dag);
                let store_bounds = site.store().get_bounds(e.producer, dag);
                let thread_bounds = gpu
                    .current_thread_loop
                    .filter(|_| nest.innermost)
                    .map(|t| t.get_bounds(e.producer, dag));

                let bpp = producer.bytes_per_point;
                let (mut fp, mut thread_fp, mut compute_fp, mut store_fp, mut task_fp) =
                    (Footprint::new(bpp), Footprint::new(bpp), Footprint::new(bpp), Footprint::new(bpp), Footprint::new(bpp));
                let vector_dim = site.produce.and_then(|l| l.vector_dim);
                for i in 0..producer.dimensions() {
                    let dense = (producer.is_input && i == 0) || Some(i) == vector_dim;
                    let thread_extent = thread_bounds.as_ref().map_or(1, |b| b.region_required[i].extent());
                    fp.add(bounds.region_required[i].extent(), dense);
                    thread_fp.add(thread_extent, dense);
                    compute_fp.add(compute_bounds.region_computed[i].extent(), dense);
                    store_fp.add(store_bounds.region_required[i].extent(), dense);
                    task_fp.add(task_bounds.region_required[i].extent(), dense);
                }
                if !scheduled {
                    for f in [&mut fp, &mut thread_fp, &mut compute_fp, &mut store_fp, &mut task_fp] {
                        f.assume_best_layout();
                    }
                }

                let mut store_instances_per_consumption = 1;
                if !producer.is_input {
                    let producer_store_instances = if scheduled {
                        self.feat(producer.stages[0]).num_realizations as i64
                    } else {
                        site.num_realizations
                    };
                    assert!(producer_store_instances > 0, "feature invariant: {} is never realized", producer.name);
                    if producer_store_instances > consumer_instances {
                        store_instances_per_consumption = producer_store_instances / consumer_instances;
                    }
                }

                let memory = site.memory_type;
                if matches!(memory, MemoryType::Global | MemoryType::Shared) {
                    loads.allocation_bytes.add(memory, compute_fp.bytes);
                }
                if store_instances_per_consumption > 1 {
                    loads.bytes.add(memory, store_fp.bytes);
                    loads.lines.add(memory, store_fp.lines);
                    loads.bytes_per_thread.add(memory, store_fp.bytes);
                    loads.lines_per_thread.add(memory, store_fp.lines);
                } else {
                    loads.bytes.add(memory, fp.bytes);
                    loads.lines.add(memory, fp.lines);
                    let per_thread = if memory == MemoryType::Registers
                        && site.store.map(LoopNest::id) != gpu.current_thread_loop.map(LoopNest::id)
                    {
                        store_fp
                    } else {
                        thread_fp
                    };
                    loads.bytes_per_thread.add(memory, per_thread.bytes);
                    loads.lines_per_thread.add(memory, per_thread.lines);
                }
            }
        }

        let own_memory = sites.of_node(node.id, ctx).memory_type;
        if at_production {
            let feat = self.feat(stage.id);
            feat.global_allocation_bytes_read_per_realization = loads.allocation_bytes.global as f64;
            feat.shared_allocation_bytes_read_per_realization = loads.allocation_bytes.shared as f64;
            feat.unique_global_bytes_read_per_realization = loads.bytes.global as f64;
            feat.unique_shared_bytes_read_per_realization = loads.bytes.shared as f64;
            feat.unique_register_bytes_read_per_realization = loads.bytes.registers as f64;
            feat.unique_global_lines_read_per_realization = loads.lines.global as f64;
            feat.unique_shared_lines_read_per_realization = loads.lines.shared as f64;
            feat.unique_register_lines_read_per_realization = loads.lines.registers as f64;

            // Update stages read the func they update.
            if !at_pure_production {
                let bytes = feat.bytes_at_production;
                let lines = if feat.innermost_bytes_at_production > 0.0 {
                    (bytes / feat.innermost_bytes_at_production).floor()
                } else {
                    0.0
                };
                match own_memory {
                    MemoryType::Global => {
                        feat.unique_global_bytes_read_per_realization += bytes;
                        feat.unique_global_lines_read_per_realization += lines;
                        feat.global_allocation_bytes_read_per_realization += bytes;
                    }
                    MemoryType::Shared => {
                        feat.unique_shared_bytes_read_per_realization += bytes;
                        feat.unique_shared_lines_read_per_realization += lines;
                        feat.shared_allocation_bytes_read_per_realization += bytes;
                    }
                    MemoryType::Registers => {
                        feat.unique_register_bytes_read_per_realization += bytes;
                        feat.unique_register_lines_read_per_realization += lines;
                        feat.register_allocation_bytes_read_per_realization += bytes;
                    }
                    MemoryType::Local | MemoryType::Inlined => {}
                }
            }
        }

        if nest.innermost {
            let (global_loads, shared_loads) = self.memory_transactions(nest, &accesses, gpu);
            let (global_stores, shared_stores) = self.store_transactions(nest, stage, own_memory, gpu);
            let feat = self.feat(stage.id);
            feat.points_computed_per_thread = gpu.total_serial_extents() as f64;
            feat.unique_global_bytes_read_per_thread = loads.bytes_per_thread.global as f64;
            feat.unique_shared_bytes_read_per_thread = loads.bytes_per_thread.shared as f64;
            feat.unique_register_bytes_read_per_thread = loads.bytes_per_thread.registers as f64;
            feat.unique_global_lines_read_per_thread = loads.lines_per_thread.global as f64;
            feat.unique_shared_lines_read_per_thread = loads.lines_per_thread.shared as f64;
            feat.unique_register_lines_read_per_thread = loads.lines_per_thread.registers as f64;
            if feat.num_productions > 0.0 {
                feat.points_computed_per_production = subinstances as f64 / feat.num_productions;
            }
            feat.unique_bytes_read_per_point = loads.bytes.total() as f64;
            feat.unique_lines_read_per_point = loads.lines.total() as f64;

            feat.num_global_mem_loads_per_block = global_loads.transactions;
            feat.global_mem_load_efficiency = global_loads.efficiency();
            feat.num_shared_mem_loads_per_block = shared_loads.transactions;
            feat.shared_mem_load_efficiency = shared_loads.efficiency();
            feat.num_global_mem_stores_per_block = global_stores.transactions;
            feat.global_mem_store_efficiency = global_stores.efficiency();
            feat.num_shared_mem_stores_per_block = shared_stores.transactions;
            feat.shared_mem_store_efficiency = shared_stores.efficiency();
        }
    }

    /// Loop of the innermost stage that adjacent lanes advance along, when
    /// the enclosing thread loop iterates this stage.
    fn lane_loop(nest: &LoopNest, gpu: &GpuLoopInfo<'a>) -> Option<usize> {
        let info = gpu.thread_info.as_ref()?;
        let thread = gpu.current_thread_loop?;
        (thread.stage == nest.stage).then(|| info.loop_indices[0])
    }

    /// Requests issued per block by one thread's points, times active warps.
    fn requests_per_block(nest: &LoopNest, gpu: &GpuLoopInfo<'a>, info: &ThreadInfo) -> f64 {
        let points_per_thread = gpu.total_inner_serial_extents * nest.size.iter().product::<i64>();
        (points_per_thread * info.num_active_warps_per_block) as f64
    }

    fn memory_transactions(&self, nest: &LoopNest, accesses: &[Access], gpu: &GpuLoopInfo<'a>) -> (MemInfo, MemInfo) {
        let ctx = self.ctx;
        let mut global = MemInfo::default();
        let mut shared = MemInfo::default();
        let Some(info) = gpu.thread_info.as_ref().filter(|_| ctx.has_gpu() && !nest.size.is_empty()) else {
            return (global, shared);
        };
        let lanes = info.num_active_threads / info.num_active_warps_per_block.max(1);
        let lane_loop = Self::lane_loop(nest, gpu);
        let requests = Self::requests_per_block(nest, gpu, info);

        for a in accesses {
            let producer = ctx.dag.node(a.producer);
            let site = self.sites.of_node(a.producer, ctx);
            let innermost_dim = if producer.is_input {
                Some(0)
            } else if site.is_scheduled() {
                site.produce.and_then(|l| l.vector_dim)
            } else {
                None
            };
            // Unknown layouts and lanes driven by another stage get the best case.
            let stride = match (lane_loop, innermost_dim) {
                (Some(x), Some(d)) => lane_stride(&a.map, d, x),
                _ => Some(1),
            };
            let n = requests * a.calls as f64;
            match site.memory_type {
                MemoryType::Global => global.add(global_request(stride, producer.bytes_per_point, lanes), n),
                MemoryType::Shared => shared.add(shared_request(stride, producer.bytes_per_point, lanes), n),
                _ => {}
            }
        }
        (global, shared)
    }

    fn store_transactions(
        &self,
        nest: &LoopNest,
        stage: &Stage,
        memory: MemoryType,
        gpu: &GpuLoopInfo<'a>,
    ) -> (MemInfo, MemInfo) {
        let ctx = self.ctx;
        let mut global = MemInfo::default();
        let mut shared = MemInfo::default();
        let Some(info) = gpu.thread_info.as_ref().filter(|_| ctx.has_gpu() && !nest.size.is_empty()) else {
            return (global, shared);
        };
        let node = ctx.dag.node(stage.node);
        let lanes = info.num_active_threads / info.num_active_warps_per_block.max(1);
        let map: AccessMap = (0..node.dimensions())
            .map(|d| stage.loops.iter().position(|l| l.pure_dim() == Some(d)).map(|l| (l, 1)))
            .collect();
        let stride = match Self::lane_loop(nest, gpu) {
            Some(x) => lane_stride(&map, nest.vector_dim.unwrap_or(0), x),
            None => Some(1),
        };
        let n = Self::requests_per_block(nest, gpu, info);
        match memory {
            MemoryType::Global => global.add(global_request(stride, node.bytes_per_point, lanes), n),
            MemoryType::Shared => shared.add(shared_request(stride, node.bytes_per_point, lanes), n),
            _ => {}
        }
        (global, shared)
    }

    /// Record what each func inlined here costs this consumer.
    fn inlined_features(
        &mut self,
        nest: &LoopNest,
        stage: &Stage,
        subinstances: i64,
        parallelism: i64,
        gpu: &GpuLoopInfo<'a>,
    ) {
        if nest.inlined.is_empty() {
            return;
        }
        let feat = *self.feat(stage.id);
        for (&f, &calls) in &nest.inlined {
            let (num_warps_per_block, num_threads_per_block) = match &gpu.thread_info {
                Some(info) if !nest.size.is_empty() => {
                    (calls * gpu.total_serial_extents() * info.num_warps_per_block * parallelism, info.num_threads)
                }
                _ => (calls, 1),
            };
            let record = FeatureIntermediates {
                inlined_calls: (calls * subinstances) as f64,
                num_scalars: calls as f64 * feat.num_scalars,
                innermost_pure_loop_extent: feat.innermost_pure_loop_extent,
                outer_parallelism: parallelism as f64,
                num_warps_per_block: num_warps_per_block as f64,
                num_threads_per_block: num_threads_per_block as f64,
                points_computed_per_thread: calls as f64 * feat.points_computed_per_thread,
            };
            let inlined_stage = self.stage0(f);
            self.intermediates.entry(inlined_stage).or_default().insert(stage.id, record);
        }
    }

    fn shared_mem_occupancy(&mut self, s: StageId) {
        let gpu = &self.ctx.config.gpu;
        let total = self.sites.total_shared_mem_alloc_sizes.get(&s).copied().unwrap_or(0);
        let limit = gpu.shared_memory_limit();
        let sm_limit = gpu.shared_memory_sm_limit();
        let block_limit = gpu.active_block_limit;
        let feat = self.feat(s);
        if limit > 0 {
            feat.shared_mem_occupancy = total as f64 / limit as f64;
        }
        if total > 0 {
            let max_active_blocks = block_limit.min(sm_limit / total);
            feat.shared_mem_block_limit_factor = max_active_blocks as f64 / block_limit as f64;
        }
    }
}

fn warp_features(feat: &mut ScheduleFeatures, info: &ThreadInfo, num_blocks: i64) {
    feat.warp_lane_utilization = info.warp_lane_utilization();
    feat.warp_lane_utilization_at_block_y = info.warp_lane_utilization_at_block(1);
    feat.warp_lane_utilization_at_block_z = info.warp_lane_utilization_at_block(2);
    feat.num_active_warps_per_block = info.num_active_warps_per_block as f64;
    feat.idle_lane_wastage = info.idle_lane_wastage();
    feat.num_warps_per_block = info.num_warps_per_block as f64;
    feat.num_blocks = num_blocks as f64;
    feat.block_occupancy = info.block_occupancy();
    feat.num_threads_per_block = info.num_threads as f64;
}

/// Occupancy bounded by the resident block and warp limits of one SM.
fn warp_and_block_occupancy(
    feat: &mut ScheduleFeatures,
    info: &ThreadInfo,
    num_blocks: i64,
    parallelism: i64,
    active_block_limit: i64,
    active_warp_limit: i64,
) {
    let warps_per_block = info.num_warps_per_block.max(1);
    let blocks_per_sm = (num_blocks + parallelism - 1) / parallelism;
    let max_theoretical_active_blocks = active_block_limit.min(blocks_per_sm);
    let max_active_warps = active_warp_limit.min(max_theoretical_active_blocks * warps_per_block);
    let max_active_blocks = max_active_warps / warps_per_block;
    feat.max_warp_occupancy = max_active_warps as f64 / active_warp_limit as f64;
    feat.max_block_occupancy = max_active_blocks as f64 / active_block_limit as f64;
}
