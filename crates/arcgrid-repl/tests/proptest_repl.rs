//! Property-based tests for the quorum evaluator and the reconciliation sweep.

use std::collections::BTreeMap;

use arcgrid_bus::ReplicaId;
use arcgrid_repl::consistency::sweep_filenames;
use arcgrid_repl::quorum::RejectReason;
use arcgrid_repl::{
    digest, evaluate, evaluate_final, sweep, ChecksumRecord, FailureCause, OperationOutcome,
    QuorumPolicy, SweepFinding, Verdict,
};
use proptest::prelude::*;

/// (required, max_failures, failures) with `max_failures < required` and
/// `failures <= required`.
fn complete_tally() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..12).prop_flat_map(|required| (Just(required), 0..required, 0..=required))
}

/// A namespace as filename -> content tag.
fn namespace() -> impl Strategy<Value = BTreeMap<String, u8>> {
    proptest::collection::btree_map("[a-f]{1,3}", 0u8..4, 0..40)
}

fn records(ns: &BTreeMap<String, u8>) -> Vec<ChecksumRecord> {
    ns.iter()
        .map(|(name, tag)| ChecksumRecord::new(name.clone(), digest(&[*tag])))
        .collect()
}

proptest! {
    #[test]
    fn prop_complete_tally_follows_quorum_rule((required, max_failures, failures) in complete_tally()) {
        let successes = required - failures;
        let verdict = evaluate(required, successes, failures, max_failures);
        let accept = failures <= max_failures && successes >= required - max_failures;
        prop_assert_eq!(verdict.is_accept(), accept);
        prop_assert_eq!(verdict.is_reject(), !accept);
        prop_assert_eq!(evaluate_final(required, successes, failures, max_failures), verdict);
    }

    #[test]
    fn prop_incomplete_tally_is_pending_then_rejected(
        (required, max_failures, failures) in complete_tally(),
        missing in 1usize..4,
    ) {
        let answered = required.saturating_sub(missing);
        let failures = failures.min(answered);
        let successes = answered - failures;
        prop_assume!(successes + failures < required);

        prop_assert_eq!(evaluate(required, successes, failures, max_failures), Verdict::Pending);
        let is_missing = matches!(
            evaluate_final(required, successes, failures, max_failures),
            Verdict::Reject(RejectReason::MissingOutcomes { .. })
        );
        prop_assert!(is_missing);
    }

    #[test]
    fn prop_outcome_order_does_not_matter(
        outcomes in proptest::collection::vec(any::<bool>(), 1..10),
        max_failures in 0usize..10,
        seed in any::<u64>(),
    ) {
        let pillars: Vec<ReplicaId> = (0..outcomes.len()).map(|i| ReplicaId::new(format!("p{}", i))).collect();
        let max_failures = max_failures % outcomes.len();
        let policy = QuorumPolicy::new(pillars.clone(), max_failures).unwrap();

        let mut forward = OperationOutcome::new(policy.clone());
        let mut shuffled = OperationOutcome::new(policy);
        let mut order: Vec<usize> = (0..outcomes.len()).collect();
        order.rotate_left((seed as usize) % outcomes.len());
        order.reverse();

        for i in 0..outcomes.len() {
            record(&mut forward, &pillars[i], outcomes[i]);
        }
        for &i in &order {
            record(&mut shuffled, &pillars[i], outcomes[i]);
            // Redelivery changes nothing.
            record(&mut shuffled, &pillars[i], outcomes[i]);
        }
        prop_assert_eq!(forward.verdict(), shuffled.verdict());
        prop_assert_eq!(forward.failed().len(), shuffled.failed().len());
        prop_assert!(forward.succeeded().iter().all(|p| !forward.failed().contains_key(p)));
    }

    #[test]
    fn prop_sweep_matches_set_comparison(authoritative in namespace(), reported in namespace()) {
        let left = records(&authoritative);
        let right = records(&reported);
        let findings: Vec<SweepFinding> = sweep(left.into_iter().map(Ok), right.into_iter().map(Ok))
            .collect::<Result<_, _>>()
            .unwrap();

        let mut expected = Vec::new();
        let names: std::collections::BTreeSet<&String> = authoritative.keys().chain(reported.keys()).collect();
        for name in names {
            match (authoritative.get(name), reported.get(name)) {
                (Some(a), None) => expected.push(SweepFinding::Missing {
                    filename: name.clone(),
                    expected: digest(&[*a]),
                }),
                (None, Some(b)) => expected.push(SweepFinding::Unexpected {
                    filename: name.clone(),
                    reported: digest(&[*b]),
                }),
                (Some(a), Some(b)) if a != b => expected.push(SweepFinding::Mismatch {
                    filename: name.clone(),
                    expected: digest(&[*a]),
                    reported: digest(&[*b]),
                }),
                _ => {}
            }
        }
        prop_assert_eq!(findings, expected);
    }

    #[test]
    fn prop_filename_sweep_is_symmetric(authoritative in namespace(), reported in namespace()) {
        let left: Vec<String> = authoritative.keys().cloned().collect();
        let right: Vec<String> = reported.keys().cloned().collect();
        let forward = sweep_filenames(left.clone().into_iter().map(Ok), right.clone().into_iter().map(Ok))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let backward = sweep_filenames(right.into_iter().map(Ok), left.into_iter().map(Ok))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        prop_assert_eq!(forward.len(), backward.len());
    }
}

fn record(outcome: &mut OperationOutcome, pillar: &ReplicaId, ok: bool) {
    if ok {
        outcome.record_success(pillar).unwrap();
    } else {
        outcome
            .record_failure(pillar, FailureCause::Reported("failed".into()))
            .unwrap();
    }
}

#[test]
fn test_quorum_table_five_pillars_one_tolerated() {
    assert_eq!(evaluate(5, 5, 0, 1), Verdict::Accept);
    assert_eq!(evaluate(5, 4, 1, 1), Verdict::Accept);
    assert!(evaluate(5, 3, 2, 1).is_reject());
    // One pillar never answered and was expired into a failure.
    assert_eq!(evaluate(5, 4, 1, 1), Verdict::Accept);
    assert!(evaluate_final(5, 4, 0, 1).is_reject());
}
