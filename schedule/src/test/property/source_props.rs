//! Properties of schedule source sanitization.

use proptest::prelude::*;

use crate::apply::sanitize_names;

/// Strings over the characters that matter: markers, quotes and filler.
fn arb_source() -> impl Strategy<Value = String> {
    proptest::collection::vec(prop_oneof![Just('$'), Just('"'), Just('x'), Just('_'), Just(' '), Just('.')], 0..64)
        .prop_map(|cs| cs.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn sanitize_is_idempotent(s in arb_source()) {
        let once = sanitize_names(&s);
        prop_assert_eq!(sanitize_names(&once), once);
    }

    #[test]
    fn sanitize_touches_only_unquoted_markers(s in arb_source()) {
        let out = sanitize_names(&s);
        prop_assert_eq!(out.len(), s.len());
        let mut in_quotes = false;
        for (a, b) in s.chars().zip(out.chars()) {
            if a == '"' {
                in_quotes = !in_quotes;
            }
            match (a, in_quotes) {
                ('$', false) => prop_assert_eq!(b, '_'),
                _ => prop_assert_eq!(a, b),
            }
        }
    }

    #[test]
    fn quoted_markers_survive(name in "[a-z]{1,8}", suffix in "[0-9]{1,3}") {
        let decl = format!("Var {name}${suffix}(\"{name}${suffix}\");");
        let expected = format!("Var {name}_{suffix}(\"{name}${suffix}\");");
        prop_assert_eq!(sanitize_names(&decl), expected);
    }
}
