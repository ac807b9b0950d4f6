//! Comprehensive property-based tests for the pre-commit gate
//!
//! Covers the pure building blocks of racetrap with proptest:
//! 1. Wildcard signature matching
//! 2. Hit-count window matching
//! 3. Plan and bug line parsing
//! 4. Location pair ordering
//! 5. Trap plan merging

use proptest::prelude::*;
use racetrap::hit_count::HitCount;
use racetrap::persistence::{self, LocationPair, PlanPoint};
use racetrap::signature::{is_wildcard_match, WildcardPattern};
use racetrap::{TrapPlan, TrapPlanStore};

fn signature() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9_]{0,8}(\\.[A-Za-z][A-Za-z0-9_`]{0,8}){0,2}"
}

fn plan_point() -> impl Strategy<Value = PlanPoint> {
    (signature(), signature(), 0i32..500, 0i64..10_000, 0i64..100).prop_map(
        |(callee, caller, offset, global_hit_count, local_hit_count)| PlanPoint {
            callee,
            caller,
            offset,
            global_hit_count,
            local_hit_count,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_signature_matches_itself(sig in signature()) {
        // Property: a pattern without wildcards is an exact match
        prop_assert!(is_wildcard_match(&sig, &sig));
    }

    #[test]
    fn prop_prefix_wildcard_matches_extensions(
        prefix in signature(),
        suffix in "[A-Za-z0-9_.]{0,10}",
    ) {
        let pattern = WildcardPattern::new(&format!("{}*", prefix)).unwrap();
        let signature = format!("{}{}", prefix, suffix);
        prop_assert!(pattern.matches(&signature));
    }

    #[test]
    fn prop_regex_metacharacters_are_literal(sig in signature()) {
        // Property: '.' in a pattern only matches a literal dot
        let mangled = sig.replace('.', "x");
        if mangled != sig {
            prop_assert!(!is_wildcard_match(&mangled, &sig));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_hit_count_window_is_symmetric(
        recorded in 0i64..1000,
        delta in -50i64..50,
        window in 0i64..20,
    ) {
        let hit = HitCount::new(recorded, -1);
        prop_assert_eq!(hit.is_match(recorded + delta, window, 0, 0), delta.abs() <= window);
        prop_assert_eq!(
            hit.is_match(recorded + delta, window, 0, 0),
            hit.is_match(recorded - delta, window, 0, 0)
        );
    }

    #[test]
    fn prop_dont_care_matches_everything(local in any::<i32>(), global in any::<i32>()) {
        let hit = HitCount::new(-1, -1);
        prop_assert!(hit.is_match(local as i64, 0, global as i64, 0));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_plan_line_parses_back(a in plan_point(), b in plan_point()) {
        let line = persistence::format_plan_line(&a.to_string(), &b.to_string());
        let parsed = persistence::parse_plan_line(&line).unwrap();
        prop_assert_eq!(parsed, Some((a, b)));
    }

    #[test]
    fn prop_plan_line_parser_never_panics(line in "\\PC{0,80}") {
        let _ = persistence::parse_plan_line(&line);
        let _ = persistence::parse_bug_line(&line);
    }

    #[test]
    fn prop_location_pair_is_unordered(a in signature(), b in signature()) {
        let ab = LocationPair::new(a.clone(), b.clone());
        let ba = LocationPair::new(b, a);
        prop_assert!(ab.first() >= ab.second());
        prop_assert_eq!(&ab, &ba);

        // Property: the bug-file form parses back to the same pair
        let parsed = persistence::parse_bug_line(&ab.to_string()).unwrap();
        prop_assert_eq!(parsed, Some(ab));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_merging_preserves_hit_counts(
        callee in signature(),
        caller in signature(),
        offset in 0i32..100,
        hits in prop::collection::vec((0i64..100, 0i64..1000), 1..10),
    ) {
        let mut store = TrapPlanStore::new();
        for (local, global) in &hits {
            store
                .add_plan(
                    TrapPlan::new(callee.clone())
                        .with_caller(caller.clone())
                        .with_offset(offset)
                        .with_hit_count(HitCount::new(*local, *global)),
                )
                .unwrap();
        }

        // Property: one plan per call site, holding every recorded hit
        prop_assert_eq!(store.len(), 1);
        let plans = store.plans();
        prop_assert_eq!(plans[0].hit_counts.len(), hits.len());
    }
}
