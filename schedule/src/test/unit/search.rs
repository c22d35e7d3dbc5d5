//! Unit tests for the beam search driver.

use arbor_dag::{FunctionDag, StageMap};

use crate::apply::{Directive, Scheduled};
use crate::config::SearchSpaceOptions;
use crate::cost::{AnalyticCostModel, CostModel, CostTicket, Evaluation};
use crate::error::*;
use crate::featurize::ScheduleFeatures;
use crate::search::{SearchResult, beam_search};
use crate::test::helpers::*;

fn run(h: &Harness) -> Result<(SearchResult, Vec<(Scheduled, Directive)>)> {
    let ctx = h.ctx();
    let mut model = AnalyticCostModel::new(ctx.parallelism());
    let mut sink = Vec::new();
    let result = beam_search(&ctx, &mut model, &mut sink)?;
    Ok((result, sink))
}

/// Accepts submissions but fails to score them.
struct BrokenModel;

impl CostModel for BrokenModel {
    fn submit(&mut self, _dag: &FunctionDag, _features: &StageMap<ScheduleFeatures>) -> Result<CostTicket> {
        Ok(CostTicket(0))
    }

    fn evaluate(&mut self) -> Result<Vec<Evaluation>> {
        CostModelSnafu { message: "offline" }.fail()
    }
}

#[test]
fn test_search_is_deterministic() {
    let (a, _) = run(&Harness::blur()).unwrap();
    let (b, _) = run(&Harness::blur()).unwrap();
    assert_eq!(a.state.schedule_source, b.state.schedule_source);
    assert_eq!(a.state.cost, b.state.cost);
}

#[test]
fn test_root_and_inline_only_search_space() {
    let h = Harness::blur().with_config(|c| c.search_space = SearchSpaceOptions::ROOT_AND_INLINE_ONLY);
    let (result, _) = run(&h).unwrap();
    let root = &result.state.root;
    assert!(!root.children.is_empty());
    // Everything realized lives at root, split into blocks.
    for c in &root.children {
        assert!(c.is_gpu_block(), "{} is not a block loop", h.dag().stage(c.stage_id()).name);
        assert!(root.store_at.contains(&c.node_id()));
    }
}

#[test]
fn test_beam_of_one_completes() {
    let h = Harness::reduction(256, 64).with_config(|c| c.search.beam_size = 1);
    let (result, sink) = run(&h).unwrap();
    assert_eq!(result.state.num_decisions_made, 2 * h.dag().nodes().len());
    let sum = h.node("sum");
    assert!(h.dag().node(sum).stages.iter().all(|s| sink.iter().any(|(on, _)| *on == Scheduled::Stage(*s))));
}

#[test]
fn test_single_core_is_not_parallelized() {
    let h = Harness::pointwise_2d(512, 512).with_cpu().with_config(|c| c.gpu.parallelism = 1);
    let (result, sink) = run(&h).unwrap();
    assert!(!result.state.root.children.iter().any(|c| c.parallel));
    assert!(!sink.iter().any(|(_, d)| matches!(d, Directive::Parallel(_))));
}

#[test]
fn test_model_failure_aborts_search() {
    let h = Harness::pointwise_1d(1024);
    let ctx = h.ctx();
    let mut sink = Vec::new();
    let err = beam_search(&ctx, &mut BrokenModel, &mut sink).unwrap_err();
    assert!(matches!(err, ScheduleError::CostModel { .. }));
    assert!(sink.is_empty());
}

#[test]
fn test_stats_account_for_every_child() {
    let (result, _) = run(&Harness::blur()).unwrap();
    let s = &result.stats;
    assert_eq!(s.decisions, 2 * 3);
    assert!(s.states_generated >= s.states_evaluated);
    assert!(s.states_evaluated > 0);
}
