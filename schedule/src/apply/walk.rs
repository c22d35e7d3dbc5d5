//! Per-stage schedule state, built by one walk over the loop nest.

use std::collections::{BTreeMap, BTreeSet};

use arbor_dag::{EdgeId, FunctionDag, Node, NodeId, Stage, StageId, StageMap};

use super::{Directive, LoopLevel, MemoryKind, TailStrategy};
use crate::context::Context;
use crate::loop_nest::{Bound, LoopNest};

/// Allocations smaller than this made below the second loop level go on the
/// stack on CPU targets.
const STACK_ALLOCATION_BYTES: f64 = 64000.0;

/// One loop variable of a stage as the splits so far have left it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuncVar {
    /// Variable of the stage's definition this one was split from.
    pub orig: String,
    pub var: String,
    pub is_rvar: bool,
    /// Expression retrieving the variable from its func; empty for
    /// variables introduced by splits.
    pub accessor: String,
    pub extent: i64,
    pub constant_extent: bool,
    pub outermost: bool,
    pub parallel: bool,
    pub exists: bool,
    pub pure: bool,
    /// Loop of the stage this variable iterates.
    pub index: usize,
    pub innermost_pure_dim: bool,
    pub vectorized: bool,
    pub gpu_threads: bool,
}

/// A producer whose region inside a thread loop is small and static enough
/// to copy into registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingCandidate {
    /// Edges from the consumer stage back to the producer, through inlined funcs.
    pub chain: Vec<EdgeId>,
    /// Extent of every loop of the producer's pure stage.
    pub extents: Vec<(String, i64)>,
}

#[derive(Debug, Clone)]
pub struct StageScheduleState {
    pub node: NodeId,
    pub stage: StageId,
    /// Parallelism left over for this stage's loops.
    pub num_cores: f64,
    pub vector_dim: Option<usize>,
    pub vectorized_loop_index: Option<usize>,
    /// Innermost first.
    pub vars: Vec<FuncVar>,
    /// The existing variables in their final order.
    pub ordered_vars: Vec<FuncVar>,
    pub parallel: bool,
    pub vectorized: bool,
    pub vectorized_var: Option<FuncVar>,
    pub all_innermost_unrolled: bool,
    /// Stages whose loops enclose this stage's outermost loop, outermost first.
    pub ancestors: Vec<StageId>,
    pub producers_to_be_staged: BTreeMap<NodeId, Vec<StagingCandidate>>,
    pub directives: Vec<Directive>,
}

impl StageScheduleState {
    fn new(nest: &LoopNest, stage: &Stage, node: &Node, parent_bounds: &Bound, ctx: &Context, num_cores: f64, ancestors: &[StageId]) -> Self {
        let mut vars: Vec<FuncVar> = stage
            .loops
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let span = parent_bounds.loops[stage.index][i];
                let accessor = match l.pure_dim() {
                    Some(d) => format!("{}.args()[{d}]", node.name),
                    None => format!("{}.get_schedule().dims()[{i}].var", stage.name),
                };
                FuncVar {
                    orig: l.name.clone(),
                    var: l.name.clone(),
                    is_rvar: l.is_rvar(),
                    accessor,
                    extent: span.extent(),
                    constant_extent: span.constant_extent(),
                    outermost: true,
                    parallel: if l.is_pure() && ctx.has_gpu() { nest.is_gpu_block() } else { nest.parallel },
                    exists: true,
                    pure: l.is_pure(),
                    index: i,
                    innermost_pure_dim: nest.vectorized_loop_index == Some(i),
                    vectorized: false,
                    gpu_threads: false,
                }
            })
            .collect();

        // The vectorized dimension goes first among the pure dimensions.
        if let Some(vli) = nest.vectorized_loop_index {
            let mut i = vli;
            while i > 0 && vars[i - 1].pure {
                vars.swap(i - 1, i);
                i -= 1;
            }
        }

        Self {
            node: node.id,
            stage: stage.id,
            num_cores,
            vector_dim: nest.vector_dim,
            vectorized_loop_index: nest.vectorized_loop_index,
            vars,
            ordered_vars: Vec::new(),
            parallel: false,
            vectorized: false,
            vectorized_var: None,
            all_innermost_unrolled: false,
            ancestors: ancestors.to_vec(),
            producers_to_be_staged: BTreeMap::new(),
            directives: Vec::new(),
        }
    }
}

// ============================================================================
// WALK
// ============================================================================

pub(super) struct Walk<'a, 'c> {
    ctx: &'a Context<'c>,
    states: StageMap<StageScheduleState>,
    all_inlined: BTreeSet<NodeId>,
}

impl<'a, 'c> Walk<'a, 'c> {
    pub(super) fn new(ctx: &'a Context<'c>, root: &LoopNest) -> Self {
        let mut all_inlined = BTreeSet::new();
        root.collect_all_inlined(&mut all_inlined);
        Self { ctx, states: StageMap::new(), all_inlined }
    }

    pub(super) fn run(mut self, root: &LoopNest) -> StageMap<StageScheduleState> {
        let num_cores = self.ctx.parallelism() as f64;
        let mut ancestors = Vec::new();
        for c in &root.children {
            self.visit(c, LoopLevel::Root, num_cores, 1, root, c, &mut ancestors);
            if self.ctx.dag.stage(c.stage_id()).index == 0 {
                self.state_mut(c.stage_id()).directives.push(Directive::Compute(LoopLevel::Root));
            }
        }
        self.states
    }

    fn state_mut(&mut self, s: StageId) -> &mut StageScheduleState {
        match self.states.get_mut(&s) {
            Some(state) => state,
            None => panic!("apply invariant: stage {} was never visited", self.ctx.dag.stage(s).name),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit<'n>(
        &mut self,
        nest: &'n LoopNest,
        mut here: LoopLevel,
        mut num_cores: f64,
        depth: usize,
        parent: &'n LoopNest,
        compute_site: &'n LoopNest,
        ancestors: &mut Vec<StageId>,
    ) {
        let ctx = self.ctx;
        let dag = ctx.dag;
        let node = dag.node(nest.node_id());
        let stage = dag.stage(nest.stage_id());
        let compute_site = if parent.node != nest.node { nest } else { compute_site };

        let parent_bounds = parent.get_bounds(node.id, dag);
        let state = self
            .states
            .entry(stage.id)
            .or_insert_with(|| StageScheduleState::new(nest, stage, node, &parent_bounds, ctx, num_cores, ancestors));

        if stage.index == 0 && parent.node != nest.node && !ctx.has_gpu() {
            let bytes = node.bytes_per_point as f64
                * parent_bounds.region_computed.iter().map(|p| p.extent() as f64).product::<f64>();
            // Small and allocated more than once.
            if bytes < STACK_ALLOCATION_BYTES && depth > 2 {
                state.directives.push(Directive::StoreIn(MemoryKind::Stack));
            }
        }

        // Reduction variables always guard.
        let pure_var_tail = if !compute_site.accesses_input_buffer(dag) && !node.is_output {
            TailStrategy::RoundUp
        } else if stage.index == 0 {
            TailStrategy::ShiftInwards
        } else {
            // Rounding up or recomputing an update that reads an input is unsafe.
            TailStrategy::GuardWithIf
        };

        if !nest.size.is_empty() {
            if nest.innermost {
                for (v, l) in state.vars.iter_mut().zip(&stage.loops) {
                    v.gpu_threads = nest.is_gpu_thread() && l.is_pure();
                }
                if nest.vectorized_loop_index.is_some() {
                    let Some(v) = state.vars.iter_mut().find(|v| v.innermost_pure_dim) else {
                        panic!("apply invariant: {} has a vectorized loop but no innermost pure variable", stage.name);
                    };
                    assert!(v.exists, "apply invariant: vectorized variable {} of {} was split away", v.var, stage.name);
                    // GPU vectors of one lane are not worth vectorizing.
                    if !ctx.has_gpu() || stage.vector_size > 1 {
                        state.directives.push(Directive::Vectorize(v.var.clone()));
                        v.vectorized = true;
                        state.vectorized = true;
                        state.vectorized_var = Some(v.clone());
                    }
                }
            } else {
                here = self.split_for_inner_loops(nest, stage, pure_var_tail);
            }
        }

        if nest.innermost {
            assert!(nest.store_at.is_empty(), "apply invariant: innermost loop of {} stores funcs", stage.name);
            assert!(nest.children.is_empty(), "apply invariant: innermost loop of {} has children", stage.name);
            return;
        }

        for s in &nest.size {
            num_cores /= *s as f64;
        }

        for c in &nest.children {
            ancestors.push(stage.id);
            self.visit(c, here.clone(), num_cores, depth + 1, nest, compute_site, ancestors);
            ancestors.pop();
            if c.node != nest.node && dag.stage(c.stage_id()).index == 0 {
                self.state_mut(c.stage_id()).directives.push(Directive::Compute(here.clone()));
            }
        }

        if nest.is_gpu_thread() && self.state_mut(stage.id).all_innermost_unrolled && nest.num_serial_loops() <= 1 {
            let candidates = self.staging_candidates(nest);
            let state = self.state_mut(stage.id);
            for (producer, mut c) in candidates {
                state.producers_to_be_staged.entry(producer).or_default().append(&mut c);
            }
        }

        for f in &nest.store_at {
            let computed_here = nest.children.iter().any(|c| c.node == Some(*f));
            if !computed_here {
                let s0 = dag.node(*f).stages[0];
                self.state_mut(s0).directives.push(Directive::Store(here.clone()));
            }
        }
    }

    /// Split every variable of the stage at `nest` into the part iterated here
    /// and the part iterated by the inner loops of the same func. Returns the
    /// level children of `nest` are computed at.
    fn split_for_inner_loops(&mut self, nest: &LoopNest, stage: &Stage, pure_var_tail: TailStrategy) -> LoopLevel {
        let ctx = self.ctx;
        let node = ctx.dag.node(stage.node);
        let state = self.state_mut(stage.id);

        let mut innermost_loop = nest;
        let mut child: Option<&LoopNest> = None;
        while !innermost_loop.innermost {
            let Some(c) = innermost_loop.children.iter().find(|c| c.node == nest.node) else {
                panic!("apply invariant: loop of {} has no inner loop of its own func", stage.name);
            };
            child.get_or_insert(c);
            innermost_loop = c;
        }

        let mut new_inner = Vec::with_capacity(stage.loops.len());
        for (i, l) in stage.loops.iter().enumerate() {
            let parent = &mut state.vars[i];
            parent.gpu_threads = nest.is_gpu_thread() && l.is_pure();

            let mut factor = nest.product_of_descendants(parent.index);
            let innermost_size = innermost_loop.size[parent.index];
            if child.is_some() && innermost_size > factor {
                factor = innermost_size;
            }

            let v = if !parent.exists || factor == 1 {
                FuncVar { exists: false, extent: 1, ..FuncVar::default() }
            } else if nest.size[parent.index] == 1 && parent.is_rvar {
                // Not split in this dimension.
                let mut v = parent.clone();
                v.parallel = false;
                v.gpu_threads = false;
                parent.exists = false;
                parent.extent = 1;
                v
            } else {
                let inner = format!("{}i", parent.var);
                let mut tail = pure_var_tail;
                if parent.is_rvar || (stage.index != 0 && !parent.outermost) {
                    tail = TailStrategy::GuardWithIf;
                }
                // Shifting inwards must not run off the start of the region.
                if factor > parent.extent && tail == TailStrategy::ShiftInwards {
                    tail = TailStrategy::GuardWithIf;
                }
                state.directives.push(Directive::Split {
                    old: parent.var.clone(),
                    outer: parent.var.clone(),
                    inner: inner.clone(),
                    factor,
                    tail: Some(tail),
                });
                let mut v = parent.clone();
                parent.extent = nest.size[parent.index];
                v.constant_extent = !parent.is_rvar && parent.exists;
                v.var = inner;
                v.accessor.clear();
                v.extent = factor;
                v.parallel = false;
                v.gpu_threads = false;
                v.outermost = false;
                v
            };
            new_inner.push(v);
        }

        if child.is_some_and(|c| c.innermost) {
            let n = stage.loops.len();
            let mut product_of_pure_loops = 1;
            let mut all_pure_loops_constant_size = true;
            let mut all_loops_are_pure = true;
            for v in &state.vars[..n] {
                if v.pure {
                    product_of_pure_loops *= v.extent;
                    all_pure_loops_constant_size &= v.constant_extent;
                } else if v.exists {
                    all_loops_are_pure = false;
                }
            }

            // Fully unrolled tiles let whatever is computed here live in registers.
            if product_of_pure_loops <= ctx.target.unroll_limit && all_pure_loops_constant_size {
                state.all_innermost_unrolled = all_loops_are_pure;
                state.vars[..n].sort_by_key(|v| !v.pure);
                for v in &state.vars[..n] {
                    if v.pure && v.exists && v.extent > 1 {
                        state.directives.push(Directive::Unroll(v.var.clone()));
                    }
                }
            }
        }

        let here = match state.vars.iter().find(|v| v.exists) {
            Some(v) => LoopLevel::At { func: node.name.clone(), var: v.var.clone() },
            None => LoopLevel::Outermost { func: node.name.clone() },
        };
        state.vars.splice(0..0, new_inner);
        here
    }

    /// Producers of the stage at thread loop `nest` worth copying into
    /// registers there, following edges through inlined funcs.
    fn staging_candidates(&self, nest: &LoopNest) -> BTreeMap<NodeId, Vec<StagingCandidate>> {
        let dag = self.ctx.dag;
        let mut out: BTreeMap<NodeId, Vec<StagingCandidate>> = BTreeMap::new();
        let mut done = BTreeSet::new();
        let mut pending = vec![(nest.stage_id(), Vec::new())];

        while let Some((s, chain)) = pending.pop() {
            for e in dag.incoming(s) {
                let mut chain: Vec<EdgeId> = chain.clone();
                chain.push(e.id);

                if self.all_inlined.contains(&e.producer) {
                    pending.push((dag.node(e.producer).stages[0], chain));
                    continue;
                }
                if !done.insert(e.producer) {
                    continue;
                }
                if dag.node(e.producer).is_input || !nest.has_constant_region_required(e.producer, dag) {
                    continue;
                }
                if nest.other_stage_has_same_producer(e.producer, dag) || nest.producer_computed_here_or_further_in(e.producer) {
                    continue;
                }

                let extents = bounds_along_edge_chain(nest, &chain, dag);
                out.entry(e.producer).or_default().push(StagingCandidate { chain, extents });
            }
        }
        out
    }
}

/// Loop extents of the last producer of `chain` needed by one iteration of
/// `nest`, found by expanding footprints edge by edge.
fn bounds_along_edge_chain(nest: &LoopNest, chain: &[EdgeId], dag: &FunctionDag) -> Vec<(String, i64)> {
    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        panic!("apply invariant: empty edge chain");
    };
    let consumer = dag.stage(dag.edge(*first).consumer);
    assert_eq!(Some(consumer.id), nest.stage, "apply invariant: edge chain does not start at the loop's stage");

    let mut loops = nest.get_bounds(consumer.node, dag).loops[consumer.index].clone();
    for e in chain {
        let e = dag.edge(*e);
        let region = e.expand_footprint(&loops);
        loops = dag.loops_for_region(dag.node(e.producer).stages[0], &region);
    }

    let producer = dag.stage_of(dag.edge(*last).producer, 0);
    producer.loops.iter().zip(loops).map(|(l, span)| (l.name.clone(), span.extent())).collect()
}
