//! Properties of the costing gate.

use std::sync::Arc;

use arbor_dag::{FunctionDag, StageMap};
use proptest::prelude::*;

use crate::config::GpuParams;
use crate::cost::{CostModel, CostOutcome, CostTicket, Evaluation, INFEASIBLE_COST};
use crate::error::*;
use crate::feasibility::{Infeasibility, exceeds_shared_memory_limit, shared_mem_alloc_size};
use crate::featurize::ScheduleFeatures;
use crate::loop_nest::{GpuRole, LoopNest, TileOptions};
use crate::state::SearchState;
use crate::test::helpers::*;

#[derive(Default)]
struct CountingModel {
    submitted: usize,
}

impl CostModel for CountingModel {
    fn submit(&mut self, _dag: &FunctionDag, _features: &StageMap<ScheduleFeatures>) -> Result<CostTicket> {
        self.submitted += 1;
        Ok(CostTicket(self.submitted as u64))
    }

    fn evaluate(&mut self) -> Result<Vec<Evaluation>> {
        Ok(Vec::new())
    }
}

/// `out` in one block whose thread loop has the given extents.
fn threaded(h: &Harness, x: i64, y: i64) -> LoopNest {
    let ctx = h.ctx();
    let out = h.node("out");
    let mut root = LoopNest::root();
    root.compute_here(out, true, 0, false, &ctx);
    root.store_at.insert(out);
    let mut block = (*root.children[0]).clone();
    block.gpu_role = GpuRole::Block;
    let mut thread = (*block.children[0]).clone();
    thread.gpu_role = GpuRole::Thread;
    thread.size = smallvec::smallvec![x, y];
    block.children[0] = Arc::new(thread);
    root.children[0] = Arc::new(block);
    root
}

/// blur_y tiled into blocks with blur_x stored per block.
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn oversized_blocks_never_reach_the_model(x in 33i64..=2048, y in 32i64..=64) {
        let h = Harness::pointwise_2d(4096, 4096);
        let mut state =
            SearchState { root: Arc::new(threaded(&h, x, y)), num_decisions_made: 2, ..SearchState::initial() };
        let mut model = CountingModel::default();
        let outcome = state.calculate_cost(&h.ctx(), &mut model).unwrap();
        prop_assert_eq!(outcome, CostOutcome::Infeasible(Infeasibility::InvalidThreadExtents));
        prop_assert_eq!(model.submitted, 0);
        prop_assert_eq!(state.cost, INFEASIBLE_COST);
        prop_assert!(state.ticket.is_none());
    }

    #[test]
    fn shared_limit_is_inclusive(limit_kb in 1i64..=16) {
        let h = Harness::blur().with_config(|c| c.gpu = GpuParams::builder().shared_memory_limit_kb(limit_kb).build());
        let root = blocked_blur(&h);
        let bytes = shared_mem_alloc_size(&root.children[0], &root.children[0], h.dag());
        prop_assert_eq!(exceeds_shared_memory_limit(&root, &h.ctx()), bytes > limit_kb * 1024);
    }
}
