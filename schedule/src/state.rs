//! Search states: a loop nest plus what the search knows about it.
//!
//! States are persistent. A child starts out sharing its parent's loop nest
//! and replaces the parts a decision changes; nothing reachable from a state
//! is ever mutated.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use arbor_dag::{FunctionDag, NodeId, StageId, StageMap};

use crate::apply::{self, Materialized, ScheduleSink};
use crate::context::Context;
use crate::cost::{CostModel, CostOutcome, CostTicket, Evaluation, INFEASIBLE_COST, PruneReason};
use crate::error::*;
use crate::feasibility::{self, Infeasibility};
use crate::featurize::sites::collect_stages;
use crate::featurize::{self, FeatureStats, ScheduleFeatures, root_for_features};
use crate::loop_nest::LoopNest;

/// Points computed beyond this multiple of the minimum count as redundant.
const MAX_RECOMPUTE_FACTOR: f64 = 8.0;
/// Inlined call counts at which code size explodes.
const MAX_INLINED_CALLS: i64 = 256;

#[derive(derive_more::Debug, Clone)]
pub struct SearchState {
    pub root: Arc<LoopNest>,
    /// Meaningless until the cost model has scored the state.
    pub cost: f64,
    pub cost_per_stage: StageMap<f64>,
    pub num_decisions_made: usize,
    /// Submission awaiting a score.
    pub ticket: Option<CostTicket>,
    #[debug(skip)]
    pub parent: Weak<SearchState>,
    /// Funcs the search offers to inline even when inlining looks wasteful.
    pub always_consider_inline: BTreeSet<NodeId>,
    pub schedule_source: String,
}

impl Default for SearchState {
    fn default() -> Self {
        Self {
            root: Arc::new(LoopNest::root()),
            cost: INFEASIBLE_COST,
            cost_per_stage: StageMap::new(),
            num_decisions_made: 0,
            ticket: None,
            parent: Weak::new(),
            always_consider_inline: BTreeSet::new(),
            schedule_source: String::new(),
        }
    }
}

impl SearchState {
    /// The state before any decision.
    pub fn initial() -> Self {
        Self::default()
    }

    /// A child sharing this state's loop nest.
    pub fn make_child(self: &Arc<Self>) -> Self {
        Self {
            root: self.root.clone(),
            cost: self.cost,
            cost_per_stage: self.cost_per_stage.clone(),
            num_decisions_made: self.num_decisions_made,
            ticket: None,
            parent: Arc::downgrade(self),
            always_consider_inline: self.always_consider_inline.clone(),
            schedule_source: String::new(),
        }
    }

    /// Fingerprint of the decisions made and the tree shape down to `depth`.
    pub fn structural_hash(&self, depth: i32) -> u64 {
        let mut h = self.num_decisions_made as u64;
        self.root.structural_hash(&mut h, depth);
        h
    }

    // ========================================================================
    // COSTING
    // ========================================================================

    /// Features of every scheduled stage, or `None` when some thread-local
    /// allocation cannot be promoted to registers.
    pub fn compute_featurization(&self, ctx: &Context) -> Option<(StageMap<ScheduleFeatures>, FeatureStats)> {
        let feature_root = root_for_features(&self.root, ctx);
        let opts = ctx.config.features;
        let (features, stats) = featurize::featurize(&feature_root, ctx, opts.enable_memoized_features)?;

        if opts.enable_memoized_features && opts.verify_memoized_features {
            let (fresh, _) = featurize::featurize(&feature_root, ctx, false)?;
            for (s, f) in &fresh {
                let memoized = features.get(s);
                assert!(
                    memoized == Some(f),
                    "feature invariant: memoized features of {} differ from a fresh featurization\nmemoized:\n{}\nfresh:\n{}",
                    ctx.dag.stage(*s).name,
                    memoized.map_or_else(|| "missing".to_string(), |m| m.to_string()),
                    f
                );
            }
            assert_eq!(features.len(), fresh.len(), "feature invariant: memoized featurization has extra stages");
        }
        Some((features, stats))
    }

    /// Check feasibility, featurize and submit the state to `model`.
    ///
    /// Anything other than [`CostOutcome::Submitted`] leaves the cost at
    /// [`INFEASIBLE_COST`] and never reaches the model.
    #[tracing::instrument(skip_all, fields(decisions = self.num_decisions_made))]
    pub fn calculate_cost(&mut self, ctx: &Context, model: &mut dyn CostModel) -> Result<CostOutcome> {
        self.cost = INFEASIBLE_COST;
        self.ticket = None;

        if let Err(reason) = feasibility::check(&self.root, ctx) {
            tracing::debug!(outcome = "infeasible", %reason, "state rejected");
            return Ok(CostOutcome::Infeasible(reason));
        }

        let Some((features, stats)) = self.compute_featurization(ctx) else {
            let reason = Infeasibility::RegisterPromotion;
            tracing::debug!(outcome = "infeasible", %reason, "state rejected");
            return Ok(CostOutcome::Infeasible(reason));
        };
        tracing::trace!(memo_hits = stats.memo_hits, memo_misses = stats.memo_misses, "featurized");

        if let Some(reason) = self.prune_reason(ctx.dag, &features) {
            tracing::debug!(outcome = "pruned", %reason, "state pruned");
            return Ok(CostOutcome::Pruned(reason));
        }

        let ticket = model.submit(ctx.dag, &features)?;
        self.ticket = Some(ticket);
        Ok(CostOutcome::Submitted(ticket))
    }

    fn prune_reason(&self, dag: &FunctionDag, features: &StageMap<ScheduleFeatures>) -> Option<PruneReason> {
        for (&s, feat) in features {
            let node = dag.node_of(s);
            // Wrappers stage data on purpose.
            if node.is_wrapper || self.always_consider_inline.contains(&node.id) {
                continue;
            }
            if feat.points_computed_total + feat.inlined_calls > MAX_RECOMPUTE_FACTOR * feat.points_computed_minimum {
                tracing::trace!(
                    stage = %dag.stage(s).name,
                    points_computed_total = feat.points_computed_total,
                    inlined_calls = feat.inlined_calls,
                    points_computed_minimum = feat.points_computed_minimum,
                    "excess recompute"
                );
                return Some(PruneReason::ExcessRecompute { stage: s });
            }
        }
        if self.root.max_inlined_calls() >= MAX_INLINED_CALLS {
            return Some(PruneReason::InliningExplosion);
        }
        None
    }

    /// Record the model's score for this state's submission.
    pub fn apply_evaluation(&mut self, e: &Evaluation) {
        debug_assert_eq!(self.ticket, Some(e.ticket));
        self.cost = e.cost;
        self.cost_per_stage = e.cost_per_stage.clone();
        self.ticket = None;
    }

    // ========================================================================
    // INLINING OPTIONS
    // ========================================================================

    pub fn should_always_consider_inline(&self, node: NodeId) -> bool {
        self.always_consider_inline.contains(&node)
    }

    /// Trivial funcs, and pointwise funcs whose (transitively inlined)
    /// consumers reach a single realized func, are always worth offering for
    /// inlining.
    pub fn update_always_consider_inline_options(&mut self, node: NodeId, dag: &FunctionDag) {
        let n = dag.node(node);
        if n.is_output || n.stages.len() > 1 {
            return;
        }
        if n.trivial_to_inline {
            self.always_consider_inline.insert(node);
            return;
        }
        if !n.is_pointwise {
            return;
        }

        let mut inlined = BTreeSet::new();
        self.root.collect_all_inlined(&mut inlined);
        let mut non_inlined_consumers = BTreeSet::new();
        let mut done = BTreeSet::new();
        let mut pending = vec![node];
        while let Some(cur) = pending.pop() {
            if !done.insert(cur) {
                continue;
            }
            for e in dag.outgoing(cur) {
                let consumer = dag.stage(e.consumer).node;
                if inlined.contains(&consumer) {
                    pending.push(consumer);
                } else {
                    non_inlined_consumers.insert(consumer);
                }
            }
        }
        if non_inlined_consumers.len() == 1 {
            self.always_consider_inline.insert(node);
        }
    }

    /// Materialize this state's schedule into `sink` and keep the rendered
    /// source.
    pub fn apply_schedule(&mut self, ctx: &Context, sink: &mut dyn ScheduleSink) -> Materialized {
        let materialized = apply::apply_schedule(&self.root, ctx, sink);
        self.schedule_source = materialized.source.clone();
        materialized
    }

    /// Write the features of this state in the training dump format.
    pub fn save_featurization<W: std::io::Write>(&self, ctx: &Context, out: &mut W) -> Result<()> {
        let Some((features, _)) = self.compute_featurization(ctx) else {
            return UnfeaturizableSnafu { reason: Infeasibility::RegisterPromotion }.fail();
        };
        featurize::save_featurization(out, ctx.dag, &features)
    }

    // ========================================================================
    // DEBUGGING
    // ========================================================================

    pub fn dump(&self, dag: &FunctionDag) {
        tracing::debug!(cost = self.cost, decisions = self.num_decisions_made, "state\n{}{}", self.root.dump(dag), self.schedule_source);
    }

    /// Stages computed inside each root-level loop, keyed by that loop's stage.
    pub fn compute_locations(&self) -> StageMap<BTreeSet<StageId>> {
        let mut out: StageMap<BTreeSet<StageId>> = StageMap::new();
        for c in &self.root.children {
            let mut stages = Vec::new();
            collect_stages(c, &mut stages);
            out.entry(c.stage_id()).or_default().extend(stages.into_iter().filter(|s| *s != c.stage_id()));
        }
        out
    }

    pub fn print_compute_locations(&self, dag: &FunctionDag) {
        for (s, inside) in self.compute_locations() {
            let names: Vec<&str> = inside.iter().map(|i| dag.stage(*i).name.as_str()).collect();
            tracing::debug!(stage = %dag.stage(s).name, computed_inside = ?names, "compute location");
        }
    }
}
