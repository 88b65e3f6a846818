//! Property-based tests for fleetfeed's pure primitives.
//!
//! These tests use the `proptest` framework to check invariants across
//! randomly generated inputs: the hypervisor/container merge table, the
//! frozen bit arithmetic, the weighted queue rotation and the change-token
//! union.
//!
//! # Prerequisites
//!
//! - No database or network access required.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # Increase case count (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use fleetfeed::config::QueueWeight;
use fleetfeed::merge::{merge, merge_frozen};
use fleetfeed::queue::{merge_changes, QueueKeys};
use fleetfeed::status::Status;
use fleetfeed::worker::weighted_order;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn any_status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

// == Merge table ===============================================================

proptest! {
    /// Every (hypervisor, container) pair maps to a known status.
    #[test]
    fn prop_merge_is_total(hv in any_status(), c in prop::option::of(any_status())) {
        prop_assert!(Status::ALL.contains(&merge(hv, c)));
    }

    /// Without a container the hypervisor status passes through.
    #[test]
    fn prop_merge_absent_container_is_identity(hv in any_status()) {
        prop_assert_eq!(merge(hv, None), hv);
    }

    /// An undefined hypervisor makes every merged dimension undefined.
    #[test]
    fn prop_merge_undef_hypervisor_dominates(c in prop::option::of(any_status())) {
        prop_assert_eq!(merge(Status::Undef, c), Status::Undef);
    }

    /// A down side wins over anything but undef.
    #[test]
    fn prop_merge_down_dominates(other in any_status()) {
        prop_assume!(other != Status::Undef);
        prop_assert_eq!(merge(Status::Down, Some(other)), Status::Down);
        prop_assert_eq!(merge(other, Some(Status::Down)), Status::Down);
    }

    #[test]
    fn prop_merge_frozen_bits(hv in any::<bool>(), encap in any::<bool>()) {
        let f = merge_frozen(hv, encap);
        prop_assert!(f < 4);
        prop_assert_eq!(f & 1 == 1, hv);
        prop_assert_eq!(f & 2 == 2, encap);
    }

    /// Status strings survive a parse of their own rendering; anything else
    /// falls back to undef rather than failing.
    #[test]
    fn prop_status_parse_never_fails(s in ".{0,16}") {
        let st = Status::parse(&s);
        prop_assert_eq!(Status::parse(st.as_str()), st);
    }
}

// == Weighted rotation =========================================================

fn weights() -> impl Strategy<Value = Vec<QueueWeight>> {
    prop::collection::vec(0u32..6, 1..5).prop_map(|ws| {
        ws.into_iter()
            .enumerate()
            .map(|(i, weight)| QueueWeight {
                name: format!("kind{}", i),
                weight,
            })
            .collect()
    })
}

proptest! {
    /// Every configured queue is popped on every tick, exactly once.
    #[test]
    fn prop_weighted_order_is_permutation(queues in weights(), tick in any::<u64>()) {
        let order = weighted_order(&queues, tick);
        prop_assert_eq!(order.len(), queues.len());
        let distinct: BTreeSet<&String> = order.iter().collect();
        prop_assert_eq!(distinct.len(), queues.len());
    }

    /// Over one full cycle each queue leads exactly `weight` times.
    #[test]
    fn prop_weighted_order_first_slot_follows_weight(queues in weights()) {
        let total: u64 = queues.iter().map(|q| u64::from(q.weight)).sum();
        prop_assume!(total > 0);
        for q in &queues {
            let key = QueueKeys::for_kind(&q.name).queue;
            let leads = (0..total)
                .filter(|&tick| weighted_order(&queues, tick)[0] == key)
                .count() as u64;
            prop_assert_eq!(leads, u64::from(q.weight));
        }
    }
}

// == Change tokens =============================================================

fn tokens() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,4}@n[0-9]", 0..6)
}

proptest! {
    /// The merged token string is the sorted, de-duplicated union.
    #[test]
    fn prop_merge_changes_is_union(a in tokens(), b in tokens()) {
        let merged = merge_changes(&a.join(" "), &b);
        let got: Vec<&str> = merged.split_whitespace().collect();
        let want: BTreeSet<&str> = a.iter().chain(b.iter()).map(String::as_str).collect();
        prop_assert_eq!(got, want.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_merge_changes_is_idempotent(a in tokens()) {
        let once = merge_changes("", &a);
        let twice = merge_changes(&once, &a);
        prop_assert_eq!(once, twice);
    }
}
