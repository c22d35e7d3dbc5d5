//! Properties of loop-nest fingerprints.

use std::sync::Arc;

use proptest::prelude::*;

use crate::loop_nest::GpuRole;
use crate::state::SearchState;
use crate::test::helpers::*;

const DEPTH: i32 = 8;

fn state(h: &Harness, decisions: usize) -> SearchState {
    SearchState { root: Arc::new(h.compute_root_all()), num_decisions_made: decisions, ..SearchState::initial() }
}

/// Image sides that are whole vectors, so distinct sides give distinct loops.
fn arb_side() -> impl Strategy<Value = i64> {
    (2i64..=64).prop_map(|v| v * 4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn identical_trees_share_a_fingerprint(w in arb_side(), h in arb_side(), decisions in 0usize..8) {
        let a = state(&Harness::pointwise_2d(w, h), decisions);
        let b = state(&Harness::pointwise_2d(w, h), decisions);
        prop_assert_eq!(a.structural_hash(DEPTH), b.structural_hash(DEPTH));
    }

    #[test]
    fn children_inherit_the_fingerprint(w in arb_side(), h in arb_side()) {
        let parent = Arc::new(state(&Harness::pointwise_2d(w, h), 1));
        let child = parent.make_child();
        prop_assert_eq!(parent.structural_hash(DEPTH), child.structural_hash(DEPTH));
    }

    #[test]
    fn extents_change_the_fingerprint(
        (w1, w2) in (arb_side(), arb_side()).prop_filter("distinct", |(a, b)| a != b),
        h in arb_side(),
    ) {
        let a = state(&Harness::pointwise_2d(w1, h), 2);
        let b = state(&Harness::pointwise_2d(w2, h), 2);
        prop_assert_ne!(a.structural_hash(DEPTH), b.structural_hash(DEPTH));
    }

    #[test]
    fn role_tags_change_the_fingerprint(
        w in arb_side(),
        h in arb_side(),
        role in prop_oneof![Just(GpuRole::Block), Just(GpuRole::Thread), Just(GpuRole::Serial), Just(GpuRole::Parallelized)],
    ) {
        let harness = Harness::pointwise_2d(w, h);
        let a = state(&harness, 2);
        let mut root = harness.compute_root_all();
        let mut c = (*root.children[0]).clone();
        c.gpu_role = role;
        root.children[0] = Arc::new(c);
        let b = SearchState { root: Arc::new(root), num_decisions_made: 2, ..SearchState::initial() };
        prop_assert_ne!(a.structural_hash(DEPTH), b.structural_hash(DEPTH));
    }
}
