//! Properties of the block and thread mapping.

use proptest::prelude::*;

use crate::apply::gpu::{plan_block_fusion, plan_gpu_threads};
use crate::apply::{Directive, FuncVar, Scheduled, StageScheduleState, apply_schedule};
use crate::target::Target;
use crate::test::helpers::*;

fn arb_extents() -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(prop_oneof![1i64..=8, 1i64..=4096, 1i64..=3_000_000], 1..6)
}

/// A stage state whose loops are the given thread candidates.
fn state_with_threads(extents: &[i64]) -> StageScheduleState {
    let h = Harness::pointwise_1d(64).with_cpu();
    let ctx = h.ctx();
    let root = h.compute_root_all();
    let mut sink: Vec<(Scheduled, Directive)> = Vec::new();
    let mut m = apply_schedule(&root, &ctx, &mut sink);
    let (_, mut state) = m.stages.pop_first().expect("one stage");
    state.vars = extents
        .iter()
        .enumerate()
        .map(|(i, e)| FuncVar { var: format!("v{i}"), extent: *e, exists: true, pure: true, gpu_threads: true, ..FuncVar::default() })
        .collect();
    state
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn fused_blocks_fit_the_grid(extents in arb_extents()) {
        let target = Target::cuda();
        let constant = vec![true; extents.len()];
        let plan = plan_block_fusion(&extents, &constant, &target);
        let mut used = Vec::new();
        for (dim, loops) in plan.iter().enumerate() {
            let product: i64 = loops.iter().map(|l| extents[*l]).product();
            prop_assert!(product <= target.max_blocks[dim], "dim {dim}: {product}");
            used.extend(loops.iter().copied());
        }
        used.sort_unstable();
        used.dedup();
        prop_assert_eq!(used.len(), plan.iter().map(Vec::len).sum::<usize>(), "a loop was assigned twice");
    }

    #[test]
    fn thread_plan_fits_a_block(extents in proptest::collection::vec(1i64..=2048, 0..6)) {
        let target = Target::cuda();
        let state = state_with_threads(&extents);
        let tagged = plan_gpu_threads(&state, &target);
        prop_assert!(tagged.len() <= 3);
        let total: i64 = tagged.iter().map(|i| state.vars[*i].extent).product();
        prop_assert!(total <= target.max_threads_per_block);
        for (dim, i) in tagged.iter().enumerate() {
            prop_assert!(state.vars[*i].extent <= target.max_threads[dim]);
        }
    }
}
