//! Beam search over schedule decisions.
//!
//! Every func gets two decisions, consumers first. The first places it:
//! inlined, or realized at root or inside some consumer tile. The second
//! parallelizes it when it landed at root. Each round expands every state in
//! the beam, scores all children in one batch and keeps the cheapest
//! `beam_size`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arbor_dag::NodeId;

use crate::apply::{Materialized, ScheduleSink};
use crate::context::Context;
use crate::cost::{CostModel, CostOutcome, CostTicket};
use crate::error::*;
use crate::loop_nest::tiling::{generate_gpu_tilings, generate_serial_tilings};
use crate::loop_nest::{GpuLoopInfo, LoopNest, TileOptions};
use crate::state::SearchState;

/// Thread tilings wasting more than this fraction of warp lanes are only
/// taken when nothing better was accepted.
const MAX_IDLE_LANE_WASTAGE: f64 = 0.5;
/// Parallel tilings leaving more than this ratio of cores idle are only
/// taken when nothing better was accepted.
const MAX_IDLE_CORE_WASTAGE: f64 = 1.2;
/// Region extent a storage dimension needs before it is worth vectorizing.
const MIN_VECTOR_EXTENT: i64 = 16;
/// Hash depth telling apart states that differ anywhere in the tree.
const EXACT_HASH_DEPTH: i32 = 64;
/// Hash depth grouping states with the same coarse structure.
const COARSE_HASH_DEPTH: i32 = 1;

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub decisions: usize,
    pub states_generated: usize,
    pub states_evaluated: usize,
    pub duplicates_dropped: usize,
    pub infeasible: usize,
    pub pruned: usize,
}

#[derive(Debug)]
pub struct SearchResult {
    /// Cheapest complete state, with its rendered source.
    pub state: SearchState,
    pub materialized: Materialized,
    pub stats: SearchStats,
}

// ============================================================================
// BEAM SEARCH
// ============================================================================

/// Schedule the whole pipeline and materialize the cheapest schedule found
/// into `sink`.
#[tracing::instrument(skip_all, fields(nodes = ctx.dag.nodes().len(), beam_size = ctx.config.search.beam_size))]
pub fn beam_search(ctx: &Context, model: &mut dyn CostModel, sink: &mut dyn ScheduleSink) -> Result<SearchResult> {
    let required = 2 * ctx.dag.nodes().len();
    let beam_size = ctx.config.search.beam_size.max(1);
    let mut stats = SearchStats::default();
    let mut beam = vec![Arc::new(SearchState::initial())];

    while beam[0].num_decisions_made < required {
        stats.decisions += 1;

        // 1. EXPAND
        let mut children = Vec::new();
        for state in &beam {
            children.extend(generate_children(state, ctx, model, &mut stats)?);
        }
        stats.states_generated += children.len();

        // 2. EVALUATE
        let evaluations = model.evaluate()?;
        stats.states_evaluated += evaluations.len();
        let by_ticket: HashMap<CostTicket, usize> =
            children.iter().enumerate().filter_map(|(i, c)| c.ticket.map(|t| (t, i))).collect();
        for e in &evaluations {
            if let Some(&i) = by_ticket.get(&e.ticket) {
                children[i].apply_evaluation(e);
            }
        }

        // 3. SORT and PRUNE
        beam = select_beam(children, beam_size, &mut stats);
        let Some(best) = beam.first() else {
            tracing::warn!(decisions = stats.decisions, "every state died");
            return NoValidScheduleSnafu.fail();
        };
        tracing::debug!(
            decisions = best.num_decisions_made,
            beam = beam.len(),
            best_cost = best.cost,
            "decision made"
        );
    }

    let mut state = (*beam[0]).clone();
    if state.num_decisions_made != required {
        return IncompleteStateSnafu { made: state.num_decisions_made, required }.fail();
    }
    tracing::info!(cost = state.cost, states = stats.states_generated, "search finished");
    let materialized = state.apply_schedule(ctx, sink);
    Ok(SearchResult { state, materialized, stats })
}

/// Cheapest states first. Exact structural duplicates are dropped and every
/// further state sharing a coarse structure is ranked as if its cost were
/// multiplied by the number of such states seen before it.
fn select_beam(mut children: Vec<SearchState>, beam_size: usize, stats: &mut SearchStats) -> Vec<Arc<SearchState>> {
    children.sort_by(|a, b| a.cost.total_cmp(&b.cost));

    let mut exact = HashSet::new();
    let mut coarse: HashMap<u64, u32> = HashMap::new();
    let mut ranked = Vec::with_capacity(children.len());
    for child in children {
        if !exact.insert(child.structural_hash(EXACT_HASH_DEPTH)) {
            stats.duplicates_dropped += 1;
            continue;
        }
        let seen = coarse.entry(child.structural_hash(COARSE_HASH_DEPTH)).or_default();
        *seen += 1;
        ranked.push((child.cost * f64::from(*seen), child));
    }
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.into_iter().take(beam_size).map(|(_, s)| Arc::new(s)).collect()
}

// ============================================================================
// CHILDREN
// ============================================================================

/// Every legal way to make the next decision in `state`. Children that passed
/// the feasibility gate have been submitted to `model`; children that needed
/// no decision carry their parent's cost.
pub fn generate_children(
    state: &Arc<SearchState>,
    ctx: &Context,
    model: &mut dyn CostModel,
    stats: &mut SearchStats,
) -> Result<Vec<SearchState>> {
    let dag = ctx.dag;
    let nodes = dag.nodes();
    assert!(state.root.is_root(), "search invariant: state root is not a root loop");
    if state.num_decisions_made == 2 * nodes.len() {
        return Ok(Vec::new());
    }

    let node = &nodes[state.num_decisions_made / 2];
    let phase = state.num_decisions_made % 2;
    let mut children = Children { ctx, model, stats, out: Vec::new() };

    if node.is_input {
        children.skip(state);
        return Ok(children.out);
    }
    assert!(
        node.outgoing_edges.is_empty() || state.root.calls(node.id, dag),
        "search invariant: partial schedule never uses {}",
        node.name
    );

    if phase == 0 {
        realize(state, node.id, &mut children)?;
    } else {
        parallelize(state, node.id, &mut children)?;
    }

    if children.out.is_empty() {
        tracing::warn!(func = %node.name, "found no legal way to schedule func");
        state.dump(dag);
    }
    Ok(children.out)
}

/// Collects the children of one state.
struct Children<'c, 'a> {
    ctx: &'c Context<'a>,
    model: &'c mut dyn CostModel,
    stats: &'c mut SearchStats,
    out: Vec<SearchState>,
}

impl Children<'_, '_> {
    fn is_full(&self) -> bool {
        self.out.len() >= self.ctx.config.search.max_children_per_decision
    }

    /// The decision is a no-op; the child keeps the parent's tree and cost.
    fn skip(&mut self, state: &Arc<SearchState>) {
        let mut child = state.make_child();
        child.num_decisions_made += 1;
        self.out.push(child);
    }

    /// Cost `root` as the next decision after `base`. Returns whether the
    /// child was accepted.
    fn add(&mut self, base: &SearchState, root: LoopNest) -> Result<bool> {
        if self.is_full() {
            return Ok(false);
        }
        let mut child = base.clone();
        child.root = Arc::new(root);
        child.num_decisions_made += 1;
        match child.calculate_cost(self.ctx, &mut *self.model)? {
            CostOutcome::Submitted(_) => {
                self.out.push(child);
                Ok(true)
            }
            CostOutcome::Infeasible(_) => {
                self.stats.infeasible += 1;
                Ok(false)
            }
            CostOutcome::Pruned(_) => {
                self.stats.pruned += 1;
                Ok(false)
            }
        }
    }
}

/// First decision for `f`: inline it, or realize it somewhere.
fn realize(state: &Arc<SearchState>, f: NodeId, children: &mut Children) -> Result<()> {
    let ctx = children.ctx;
    let dag = ctx.dag;
    let node = dag.node(f);
    let root = &state.root;

    let mut base = state.make_child();
    base.update_always_consider_inline_options(f, dag);

    let mut inlined = false;
    if ctx.config.search_space.compute_inline && node.stages.len() == 1 && !node.is_output {
        let mut new_root = (**root).clone();
        new_root.inline_func(f, ctx);
        inlined = children.add(&base, new_root)?;
    }
    // Long pointwise chains are inlined without looking further.
    if inlined && node.is_pointwise && node.outgoing_edges.len() == 1 {
        return Ok(());
    }

    let mut vector_dims = Vec::new();
    if !node.is_output {
        let bounds = root.get_bounds(f, dag);
        vector_dims.extend((0..node.dimensions()).find(|v| bounds.region_computed[*v].extent() >= MIN_VECTOR_EXTENT));
    }
    // Output storage is fixed; vectorize the innermost dimension.
    if vector_dims.is_empty() {
        vector_dims.push(0);
    }

    for v in vector_dims {
        let tilings = root.compute_in_tiles(f, None, v, false, false, false, &[], ctx);
        for (wastage, new_root) in thread_tile_options(tilings, ctx) {
            if !children.out.is_empty() && wastage > MAX_IDLE_LANE_WASTAGE {
                tracing::trace!(func = %node.name, wastage, "excess idle lane wastage");
                break;
            }
            children.add(&base, new_root)?;
        }
    }
    Ok(())
}

/// Legal candidates ordered by idle warp lanes, least first.
fn thread_tile_options(nests: Vec<Arc<LoopNest>>, ctx: &Context) -> Vec<(f64, LoopNest)> {
    let mut options: Vec<(f64, LoopNest)> = nests
        .into_iter()
        .filter(|n| !ctx.has_gpu() || n.has_valid_thread_extents(ctx))
        .map(|n| {
            let wastage = if ctx.has_gpu() { n.max_idle_lane_wastage(GpuLoopInfo::default(), ctx) } else { 0.0 };
            (wastage, Arc::unwrap_or_clone(n))
        })
        .collect();
    options.sort_by(|a, b| a.0.total_cmp(&b.0));
    options
}

/// Second decision for `f`: split its root-level loops into parallel tiles.
fn parallelize(state: &Arc<SearchState>, f: NodeId, children: &mut Children) -> Result<()> {
    let ctx = children.ctx;
    let dag = ctx.dag;
    let node = dag.node(f);
    let root = &state.root;

    let pure_stage = (ctx.parallelism() > 1 && node.dimensions() > 0)
        .then(|| root.children.iter().find(|c| c.node == Some(f) && dag.stage(c.stage_id()).index == 0))
        .flatten();
    // Scalar, not at root, or a single core: nothing to decide.
    let Some(pure_stage) = pure_stage else {
        children.skip(state);
        return Ok(());
    };

    let d = node.dimensions() as isize - 1;
    let serial_tilings = generate_serial_tilings(
        &pure_stage.size,
        d,
        d,
        pure_stage.vectorized_loop_index,
        &pure_stage.generate_vec_dim_serial_tilings(ctx.target.warp_size),
        false,
        true,
    );
    assert!(!serial_tilings.is_empty(), "search invariant: no serial tiling of {}", node.name);

    let base = state.make_child();
    let inner_opts = TileOptions::inner(ctx.config.search.experimental_adjusted_tilings);

    if !ctx.has_gpu() {
        let size = &pure_stage.size;
        let inner: Vec<Vec<i64>> = serial_tilings
            .iter()
            .map(|outer| outer.iter().zip(size).map(|(o, s)| (s + o - 1) / o).collect())
            .collect();
        for o in parallel_tile_options(root, f, inner, size, ctx) {
            if !children.out.is_empty() && o.idle_core_wastage > MAX_IDLE_CORE_WASTAGE {
                break;
            }
            let new_root = tile_children_of(root, f, |c, parent| c.parallelize_in_tiles(&o.inner_tiling, parent, inner_opts, ctx));
            children.add(&base, new_root)?;
        }
        return Ok(());
    }

    // On GPU, first split into (parallel, serial) loops, then split the
    // parallel loops into (block, thread) loops.
    for parallel_t in &serial_tilings {
        let parallel_root =
            tile_children_of(root, f, |c, parent| c.parallelize_in_tiles(parallel_t, parent, TileOptions::outer(true), ctx));

        let stage_sizes = parallel_root.get_stage_sizes(f, dag);
        // Siblings at root run in separate blocks, so their thread counts
        // never combine.
        let max_size = vec![1; stage_sizes.sizes[0].len()];
        let block_tilings = generate_gpu_tilings(&stage_sizes, &max_size, d, false, true);

        if block_tilings.is_empty() {
            // Loops too small for a block tiling: one block of as many
            // threads as possible.
            tracing::debug!(func = %node.name, "no block tiling, using a single block");
            let ones = vec![1; stage_sizes.sizes[0].len()];
            let new_root = tile_children_of(&parallel_root, f, |c, parent| {
                c.parallelize_in_tiles(&ones, parent, TileOptions::outer(true), ctx)
            });
            children.add(&base, new_root)?;
            continue;
        }

        let pure_size = stage_sizes.sizes[0].clone();
        let mut prev_wastage = None;
        for o in parallel_tile_options(root, f, block_tilings, &pure_size, ctx) {
            if !children.out.is_empty()
                && o.idle_core_wastage > MAX_IDLE_CORE_WASTAGE
                && prev_wastage != Some(o.idle_core_wastage)
            {
                break;
            }
            prev_wastage = Some(o.idle_core_wastage);
            let new_root = tile_children_of(&parallel_root, f, |c, parent| {
                c.parallelize_in_tiles(&o.inner_tiling, parent, inner_opts, ctx)
            });
            children.add(&base, new_root)?;
        }
    }
    Ok(())
}

/// Copy of `root` with every root-level loop of `f` replaced by `tile`.
fn tile_children_of(
    root: &LoopNest,
    f: NodeId,
    tile: impl Fn(&LoopNest, &LoopNest) -> Arc<LoopNest>,
) -> LoopNest {
    let mut new_root = root.clone();
    new_root.children = root.children.iter().map(|c| if c.node == Some(f) { tile(&**c, root) } else { c.clone() }).collect();
    new_root
}

// ============================================================================
// PARALLEL TILE OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct ParallelTileOption {
    inner_tiling: Vec<i64>,
    outer_tiling: Vec<i64>,
    /// Rounded-up tasks per core over tasks per core, worst stage.
    idle_core_wastage: f64,
    min_parallelism: i64,
    max_parallelism: i64,
}

impl ParallelTileOption {
    /// Least idle cores first, then the most even parallelism across stages.
    fn rank(&self, other: &Self) -> Ordering {
        self.idle_core_wastage
            .total_cmp(&other.idle_core_wastage)
            .then((self.max_parallelism - self.min_parallelism).cmp(&(other.max_parallelism - other.min_parallelism)))
    }
}

/// Score inner tilings of `f` by how well their outer loops fill the
/// machine. Tilings exposing too little parallelism are dropped unless
/// nothing better exists, in which case the parallelism bar is halved until
/// something qualifies.
fn parallel_tile_options(
    root: &LoopNest,
    f: NodeId,
    inner_tilings: Vec<Vec<i64>>,
    pure_size: &[i64],
    ctx: &Context,
) -> Vec<ParallelTileOption> {
    let dag = ctx.dag;
    let parallelism = ctx.parallelism();
    let mut options = Vec::new();
    let mut insufficient = Vec::new();

    for inner_tiling in inner_tilings {
        let outer_tiling: Vec<i64> = pure_size.iter().zip(&inner_tiling).map(|(s, t)| (s + t - 1) / t).collect();

        let mut min_total = 0;
        let mut max_total = 0;
        let mut idle_core_wastage: f64 = 1.0;
        for c in root.children.iter().filter(|c| c.node == Some(f)) {
            let stage = dag.stage(c.stage_id());
            let mut total = 1;
            let mut max_available = 1;
            for (i, l) in stage.loops.iter().enumerate() {
                if let Some(p) = l.pure_dim() {
                    total *= outer_tiling[p];
                    max_available *= c.size[i];
                }
            }
            max_total = max_total.max(total);
            // A stage that cannot fill the machine anyway only rules out
            // tilings that give up some of what it has.
            if max_available >= parallelism * 2 || total != max_available {
                min_total = if min_total == 0 { total } else { min_total.min(total) };
                let tasks_per_core = total as f64 / parallelism as f64;
                idle_core_wastage = idle_core_wastage.max(tasks_per_core.ceil() / tasks_per_core);
            }
        }

        let o = ParallelTileOption {
            inner_tiling,
            outer_tiling,
            idle_core_wastage,
            min_parallelism: min_total,
            max_parallelism: max_total,
        };
        let ok = min_total >= parallelism * 2 && (max_total <= parallelism * 16 || ctx.has_gpu());
        if ok { options.push(o) } else { insufficient.push(o) }
    }

    let mut limit = parallelism;
    while options.is_empty() && !insufficient.is_empty() {
        options = insufficient.iter().filter(|o| o.min_parallelism >= limit).cloned().collect();
        limit /= 2;
    }
    options.sort_by(ParallelTileOption::rank);
    options
}
