//! Cost-model contract and a reference scorer.
//!
//! Costing is two-phase. [`CostModel::submit`] records the features of one
//! state and hands back a ticket; [`CostModel::evaluate`] later scores every
//! pending submission at once. A state's cost is unknown between the two
//! calls, and the search driver owns the point where it calls `evaluate`.

use arbor_dag::{FunctionDag, StageId, StageMap};

use crate::error::*;
use crate::feasibility::Infeasibility;
use crate::featurize::ScheduleFeatures;

/// Cost of a state that must never be chosen.
pub const INFEASIBLE_COST: f64 = 1e50;

/// Handle to one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CostTicket(pub u64);

/// Scores of one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub ticket: CostTicket,
    pub cost: f64,
    pub cost_per_stage: StageMap<f64>,
}

pub trait CostModel {
    /// Queue the features of one state for scoring.
    fn submit(&mut self, dag: &FunctionDag, features: &StageMap<ScheduleFeatures>) -> Result<CostTicket>;

    /// Score everything submitted since the last call.
    fn evaluate(&mut self) -> Result<Vec<Evaluation>>;
}

/// Soft prunes rank a state out of the search without it being illegal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PruneReason {
    /// A stage computes many more points than its cheapest schedule would.
    ExcessRecompute { stage: StageId },
    /// Inlining nests deep enough to blow up code size.
    InliningExplosion,
}

/// Result of asking for a state's cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostOutcome {
    Submitted(CostTicket),
    Infeasible(Infeasibility),
    Pruned(PruneReason),
}

impl CostOutcome {
    /// Whether the search should keep considering the state.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }

    pub fn ticket(&self) -> Option<CostTicket> {
        match self {
            Self::Submitted(t) => Some(*t),
            _ => None,
        }
    }
}

// ============================================================================
// ANALYTIC MODEL
// ============================================================================

/// Relative cost of moving one byte versus computing one point.
const BYTE_COST: f64 = 0.25;
/// Relative cost of one memory transaction issued by a block.
const TRANSACTION_COST: f64 = 0.5;
/// Relative cost of one allocation of a func's storage.
const REALIZATION_COST: f64 = 16.0;

/// Deterministic roofline-style scorer.
///
/// Each stage pays for the points it computes and the bytes it reads,
/// divided by the parallelism it exposes, with penalties for idle lanes and
/// for inefficient memory access. Used by tests and by the reference search
/// where no learned model is available.
#[derive(Debug, Clone)]
pub struct AnalyticCostModel {
    parallelism: f64,
    next_ticket: u64,
    pending: Vec<(CostTicket, StageMap<f64>)>,
}

impl AnalyticCostModel {
    pub fn new(parallelism: i64) -> Self {
        Self { parallelism: parallelism.max(1) as f64, next_ticket: 0, pending: Vec::new() }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stage_cost(&self, f: &ScheduleFeatures) -> f64 {
        let parallelism = (f.inner_parallelism * f.outer_parallelism).clamp(1.0, self.parallelism);
        let vector_lanes = f.innermost_pure_loop_extent.clamp(1.0, 8.0);
        let compute = (f.points_computed_total + f.inlined_calls) / vector_lanes + f.num_scalars;

        let bytes_per_realization = f.unique_global_bytes_read_per_realization
            + 0.25 * f.unique_shared_bytes_read_per_realization
            + f.bytes_at_production;
        let efficiency = (f.global_mem_load_efficiency * f.global_mem_store_efficiency).max(1.0 / 32.0);
        let traffic = BYTE_COST * bytes_per_realization * f.num_realizations.max(1.0) / efficiency;

        let transactions = TRANSACTION_COST
            * (f.num_global_mem_loads_per_block + f.num_global_mem_stores_per_block)
            * f.num_blocks.max(1.0);

        let lane_penalty = 1.0 + f.idle_lane_wastage;
        lane_penalty * (compute + traffic + transactions) / parallelism + REALIZATION_COST * f.num_realizations
    }
}

impl CostModel for AnalyticCostModel {
    fn submit(&mut self, _dag: &FunctionDag, features: &StageMap<ScheduleFeatures>) -> Result<CostTicket> {
        let ticket = CostTicket(self.next_ticket);
        self.next_ticket += 1;
        let per_stage = features.iter().map(|(s, f)| (*s, self.stage_cost(f))).collect();
        self.pending.push((ticket, per_stage));
        Ok(ticket)
    }

    /// Submissions whose cost is not finite get no evaluation, so their
    /// states keep [`INFEASIBLE_COST`].
    fn evaluate(&mut self) -> Result<Vec<Evaluation>> {
        let mut evaluations = Vec::with_capacity(self.pending.len());
        for (ticket, cost_per_stage) in self.pending.drain(..) {
            let cost: f64 = cost_per_stage.values().sum();
            if !cost.is_finite() {
                tracing::warn!(ticket = ticket.0, cost, "dropping non-finite cost");
                continue;
            }
            evaluations.push(Evaluation { ticket, cost, cost_per_stage });
        }
        Ok(evaluations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(points: f64, parallelism: f64) -> ScheduleFeatures {
        ScheduleFeatures {
            points_computed_total: points,
            inner_parallelism: parallelism,
            outer_parallelism: 1.0,
            num_realizations: 1.0,
            innermost_pure_loop_extent: 8.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_parallelism_lowers_cost() {
        let m = AnalyticCostModel::new(80);
        assert!(m.stage_cost(&features(1e6, 80.0)) < m.stage_cost(&features(1e6, 1.0)));
        // Parallelism beyond the machine buys nothing.
        assert_eq!(m.stage_cost(&features(1e6, 80.0)), m.stage_cost(&features(1e6, 800.0)));
    }

    #[test]
    fn test_costs_arrive_on_evaluate() {
        let dag = crate::test::helpers::Harness::pointwise_1d(16).dag().clone();
        let mut m = AnalyticCostModel::new(4);
        let mut fs = StageMap::new();
        fs.insert(StageId(0), features(16.0, 4.0));
        let a = m.submit(&dag, &fs).unwrap();
        let b = m.submit(&dag, &StageMap::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(m.pending(), 2);

        let evals = m.evaluate().unwrap();
        assert_eq!(m.pending(), 0);
        assert_eq!(evals.len(), 2);
        assert_eq!(evals[0].ticket, a);
        assert!(evals[0].cost > 0.0);
        assert_eq!(evals[1].cost, 0.0);
    }

    #[test]
    fn test_non_finite_cost_drops_only_its_ticket() {
        let dag = crate::test::helpers::Harness::pointwise_1d(16).dag().clone();
        let mut m = AnalyticCostModel::new(4);
        let mut good = StageMap::new();
        good.insert(StageId(0), features(16.0, 4.0));
        let mut bad = StageMap::new();
        bad.insert(StageId(0), features(f64::INFINITY, 4.0));

        let a = m.submit(&dag, &good).unwrap();
        let _ = m.submit(&dag, &bad).unwrap();
        let c = m.submit(&dag, &good).unwrap();
        let evals = m.evaluate().unwrap();
        assert_eq!(evals.iter().map(|e| e.ticket).collect::<Vec<_>>(), vec![a, c]);
        assert!(evals.iter().all(|e| e.cost.is_finite()));
        assert_eq!(m.pending(), 0);
    }

    #[test]
    fn test_outcome_acceptance() {
        assert!(CostOutcome::Submitted(CostTicket(3)).is_accepted());
        assert!(!CostOutcome::Infeasible(Infeasibility::SharedMemory).is_accepted());
        assert!(!CostOutcome::Pruned(PruneReason::InliningExplosion).is_accepted());
        assert_eq!(PruneReason::InliningExplosion.to_string(), "inlining_explosion");
    }
}
