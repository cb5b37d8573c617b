//! Quorum evaluation for multi-pillar operations.
//!
//! The decision itself is a pure function of four counts. [`OperationOutcome`]
//! accumulates per-pillar results for one in-flight operation and feeds them to
//! the evaluator; it is owned by whoever handles replies for that operation.

use std::collections::{BTreeMap, BTreeSet};

use arcgrid_bus::ReplicaId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ReplError, Result};

/// Which pillars take part in an operation and how many may fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pillar_ids: BTreeSet<ReplicaId>,
    max_failures: usize,
}

impl QuorumPolicy {
    /// Create a policy. Requires `0 <= max_failures < pillar count`.
    pub fn new(
        pillar_ids: impl IntoIterator<Item = ReplicaId>,
        max_failures: usize,
    ) -> Result<Self> {
        let pillar_ids: BTreeSet<ReplicaId> = pillar_ids.into_iter().collect();
        if pillar_ids.is_empty() {
            return Err(ReplError::invalid("pillar_ids", "a quorum needs at least one pillar"));
        }
        if max_failures >= pillar_ids.len() {
            return Err(ReplError::invalid(
                "max_failures",
                format!(
                    "must be below the pillar count {} but is {}",
                    pillar_ids.len(),
                    max_failures
                ),
            ));
        }
        Ok(Self {
            pillar_ids,
            max_failures,
        })
    }

    /// A policy that tolerates no failure.
    pub fn all_of(pillar_ids: impl IntoIterator<Item = ReplicaId>) -> Result<Self> {
        Self::new(pillar_ids, 0)
    }

    /// Participating pillars.
    pub fn pillar_ids(&self) -> &BTreeSet<ReplicaId> {
        &self.pillar_ids
    }

    /// Maximum tolerated failures.
    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    /// Number of pillars that must produce an outcome.
    pub fn required(&self) -> usize {
        self.pillar_ids.len()
    }
}

/// Why an operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Some pillars produced neither success nor failure.
    MissingOutcomes { expected: usize, received: usize },
    /// More pillars failed than the policy tolerates.
    TooManyFailures { failures: usize, max_failures: usize },
    /// Too few pillars succeeded to reach quorum.
    TooFewSuccesses { successes: usize, needed: usize },
}

/// Result of evaluating an outcome against a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Outcomes still outstanding.
    Pending,
    /// The operation succeeded.
    Accept,
    /// The operation failed.
    Reject(RejectReason),
}

impl Verdict {
    /// True for `Accept`.
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    /// True for `Reject`.
    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject(_))
    }
}

/// Decide an operation. `Pending` while `successes + failures < required`.
pub fn evaluate(required: usize, successes: usize, failures: usize, max_failures: usize) -> Verdict {
    if successes + failures < required {
        return Verdict::Pending;
    }
    decide(required, successes, failures, max_failures)
}

/// Decide an operation whose outstanding pillars will never answer.
/// An incomplete tally is rejected outright.
pub fn evaluate_final(
    required: usize,
    successes: usize,
    failures: usize,
    max_failures: usize,
) -> Verdict {
    if successes + failures < required {
        warn!(
            expected = required,
            received = successes + failures,
            "some pillars gave neither a failure nor a success"
        );
        return Verdict::Reject(RejectReason::MissingOutcomes {
            expected: required,
            received: successes + failures,
        });
    }
    decide(required, successes, failures, max_failures)
}

fn decide(required: usize, successes: usize, failures: usize, max_failures: usize) -> Verdict {
    if failures > max_failures {
        warn!(failures, max_failures, "more failing pillars than allowed");
        return Verdict::Reject(RejectReason::TooManyFailures {
            failures,
            max_failures,
        });
    }
    let needed = required.saturating_sub(max_failures);
    if successes < needed {
        warn!(successes, needed, "too few successful pillars");
        return Verdict::Reject(RejectReason::TooFewSuccesses { successes, needed });
    }
    if failures > 0 {
        info!(failures, max_failures, "tolerated pillar failures, operation accepted");
    }
    Verdict::Accept
}

/// Why a pillar counts as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The pillar replied with an error.
    Reported(String),
    /// The pillar did not reply before the deadline.
    NoResponse,
    /// The message could not be delivered to the pillar.
    Unreachable(String),
}

/// What happened when an outcome was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First outcome for the pillar.
    New,
    /// Same outcome again (at-least-once delivery).
    Duplicate,
    /// The pillar already has the opposite outcome; the new one is ignored.
    Conflict,
}

/// Per-pillar results of one in-flight operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    policy: QuorumPolicy,
    succeeded: BTreeSet<ReplicaId>,
    failed: BTreeMap<ReplicaId, FailureCause>,
}

impl OperationOutcome {
    /// Start an empty tally.
    pub fn new(policy: QuorumPolicy) -> Self {
        Self {
            policy,
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }

    /// The policy this tally is judged against.
    pub fn policy(&self) -> &QuorumPolicy {
        &self.policy
    }

    /// Record a success.
    pub fn record_success(&mut self, pillar: &ReplicaId) -> Result<Recorded> {
        self.check_member(pillar)?;
        if self.failed.contains_key(pillar) {
            warn!(pillar = %pillar, "success after failure ignored");
            return Ok(Recorded::Conflict);
        }
        if self.succeeded.insert(pillar.clone()) {
            Ok(Recorded::New)
        } else {
            Ok(Recorded::Duplicate)
        }
    }

    /// Record a failure.
    pub fn record_failure(&mut self, pillar: &ReplicaId, cause: FailureCause) -> Result<Recorded> {
        self.check_member(pillar)?;
        if self.succeeded.contains(pillar) {
            warn!(pillar = %pillar, cause = ?cause, "failure after success ignored");
            return Ok(Recorded::Conflict);
        }
        if self.failed.contains_key(pillar) {
            return Ok(Recorded::Duplicate);
        }
        self.failed.insert(pillar.clone(), cause);
        Ok(Recorded::New)
    }

    /// Turn every pillar without an outcome into a `NoResponse` failure.
    /// Returns the pillars that were converted.
    pub fn expire(&mut self) -> Vec<ReplicaId> {
        let missing = self.missing();
        for pillar in &missing {
            self.failed.insert(pillar.clone(), FailureCause::NoResponse);
        }
        missing
    }

    /// Pillars with no outcome yet.
    pub fn missing(&self) -> Vec<ReplicaId> {
        self.policy
            .pillar_ids
            .iter()
            .filter(|p| !self.succeeded.contains(*p) && !self.failed.contains_key(*p))
            .cloned()
            .collect()
    }

    /// True once every pillar has an outcome.
    pub fn is_complete(&self) -> bool {
        self.succeeded.len() + self.failed.len() >= self.policy.required()
    }

    /// Pillars that succeeded.
    pub fn succeeded(&self) -> &BTreeSet<ReplicaId> {
        &self.succeeded
    }

    /// Pillars that failed, with the cause.
    pub fn failed(&self) -> &BTreeMap<ReplicaId, FailureCause> {
        &self.failed
    }

    /// Current verdict; `Pending` until every pillar has an outcome.
    pub fn verdict(&self) -> Verdict {
        evaluate(
            self.policy.required(),
            self.succeeded.len(),
            self.failed.len(),
            self.policy.max_failures(),
        )
    }

    /// Verdict treating outstanding pillars as never answering.
    pub fn final_verdict(&self) -> Verdict {
        evaluate_final(
            self.policy.required(),
            self.succeeded.len(),
            self.failed.len(),
            self.policy.max_failures(),
        )
    }

    fn check_member(&self, pillar: &ReplicaId) -> Result<()> {
        if self.policy.pillar_ids.contains(pillar) {
            Ok(())
        } else {
            Err(ReplError::UnknownReplica {
                replica: pillar.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pillars(n: usize) -> Vec<ReplicaId> {
        (1..=n).map(|i| ReplicaId::new(format!("p{}", i))).collect()
    }

    fn five_tolerating_one() -> QuorumPolicy {
        QuorumPolicy::new(pillars(5), 1).unwrap()
    }

    #[test]
    fn test_policy_rejects_max_failures_at_pillar_count() {
        assert!(QuorumPolicy::new(pillars(3), 3).is_err());
        assert!(QuorumPolicy::new(pillars(3), 2).is_ok());
        assert!(QuorumPolicy::new(Vec::new(), 0).is_err());
    }

    #[test]
    fn test_policy_deduplicates_pillars() {
        let policy = QuorumPolicy::all_of(vec![ReplicaId::new("a"), ReplicaId::new("a")]).unwrap();
        assert_eq!(policy.required(), 1);
    }

    #[test]
    fn test_all_succeed_accepts() {
        assert_eq!(evaluate(5, 5, 0, 1), Verdict::Accept);
    }

    #[test]
    fn test_one_failure_within_tolerance_accepts() {
        assert_eq!(evaluate(5, 4, 1, 1), Verdict::Accept);
    }

    #[test]
    fn test_two_failures_over_tolerance_rejects() {
        assert_eq!(
            evaluate(5, 3, 2, 1),
            Verdict::Reject(RejectReason::TooManyFailures {
                failures: 2,
                max_failures: 1
            })
        );
    }

    #[test]
    fn test_incomplete_is_pending() {
        assert_eq!(evaluate(5, 4, 0, 1), Verdict::Pending);
        assert_eq!(evaluate(5, 0, 0, 1), Verdict::Pending);
    }

    #[test]
    fn test_incomplete_final_is_rejected() {
        assert_eq!(
            evaluate_final(5, 4, 0, 1),
            Verdict::Reject(RejectReason::MissingOutcomes {
                expected: 5,
                received: 4
            })
        );
    }

    #[test]
    fn test_too_few_successes_rejects() {
        // A complete tally within the failure budget always has enough
        // successes, so this rule only fires on the raw decision.
        assert_eq!(evaluate(5, 3, 1, 1), Verdict::Pending);
        assert_eq!(
            decide(5, 3, 1, 1),
            Verdict::Reject(RejectReason::TooFewSuccesses {
                successes: 3,
                needed: 4
            })
        );
    }

    #[test]
    fn test_missing_pillar_expired_as_failure_still_accepts() {
        let mut outcome = OperationOutcome::new(five_tolerating_one());
        for p in pillars(4) {
            outcome.record_success(&p).unwrap();
        }
        assert_eq!(outcome.verdict(), Verdict::Pending);
        assert!(outcome.final_verdict().is_reject());

        let expired = outcome.expire();
        assert_eq!(expired, vec![ReplicaId::new("p5")]);
        assert_eq!(outcome.failed()[&ReplicaId::new("p5")], FailureCause::NoResponse);
        // 4 successes >= 5 - 1 and 1 failure <= 1.
        assert_eq!(outcome.verdict(), Verdict::Accept);
    }

    #[test]
    fn test_two_missing_pillars_expired_rejects() {
        let mut outcome = OperationOutcome::new(five_tolerating_one());
        for p in pillars(3) {
            outcome.record_success(&p).unwrap();
        }
        outcome.expire();
        assert!(outcome.verdict().is_reject());
    }

    #[test]
    fn test_pillar_never_in_both_sets() {
        let mut outcome = OperationOutcome::new(five_tolerating_one());
        let p1 = ReplicaId::new("p1");

        assert_eq!(outcome.record_success(&p1).unwrap(), Recorded::New);
        assert_eq!(outcome.record_success(&p1).unwrap(), Recorded::Duplicate);
        assert_eq!(
            outcome
                .record_failure(&p1, FailureCause::Reported("late".into()))
                .unwrap(),
            Recorded::Conflict
        );
        assert!(outcome.succeeded().contains(&p1));
        assert!(!outcome.failed().contains_key(&p1));
    }

    #[test]
    fn test_unknown_pillar_is_an_error() {
        let mut outcome = OperationOutcome::new(five_tolerating_one());
        assert!(matches!(
            outcome.record_success(&ReplicaId::new("stranger")),
            Err(ReplError::UnknownReplica { .. })
        ));
    }

    #[test]
    fn test_order_of_outcomes_does_not_matter() {
        let policy = five_tolerating_one();
        let mut forward = OperationOutcome::new(policy.clone());
        let mut backward = OperationOutcome::new(policy);
        let ps = pillars(5);

        for (i, p) in ps.iter().enumerate() {
            if i == 2 {
                forward.record_failure(p, FailureCause::NoResponse).unwrap();
            } else {
                forward.record_success(p).unwrap();
            }
        }
        for (i, p) in ps.iter().enumerate().rev() {
            if i == 2 {
                backward.record_failure(p, FailureCause::NoResponse).unwrap();
            } else {
                backward.record_success(p).unwrap();
            }
        }
        assert_eq!(forward.verdict(), backward.verdict());
        assert!(forward.verdict().is_accept());
    }
}
