//! Checksum consistency: detect divergent replicas and correct them.
//!
//! Each file under investigation moves through
//! `Requested -> Compared -> Consistent | Diverged -> CorrectionSent -> Corrected`.
//! A correction is retried a bounded number of times; when the bound is hit
//! the file lands in `CorrectionFailed` and an operator-visible failure is
//! recorded.
//!
//! Full-namespace reconciliation uses [`sweep`], a merge-join over two sorted
//! listings that never materialises either side.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use arcgrid_bus::{Checksum, FileRef, Message, MessageId, Reply, ReplicaId, ReplicaKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checksum::{digest, ChecksumRecord};
use crate::client::ReplicaClient;
use crate::error::{ReplError, Result};

/// Operator failures kept before the oldest are dropped.
const MAX_FAILURES: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where a file stands in the consistency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    /// Checksums have been asked for.
    Requested,
    /// Reports have been compared (transient).
    Compared,
    /// Every report matches the authority.
    Consistent,
    /// At least one replica disagrees.
    Diverged,
    /// Corrections are in flight.
    CorrectionSent,
    /// Every divergent replica acknowledged its correction.
    Corrected,
    /// A correction ran out of attempts.
    CorrectionFailed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which value counts as correct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// A trusted reference value.
    Reference(Checksum),
    /// The value reported by a strict majority of the replicas.
    Majority,
}

/// Choose the value reported by more than half of the reports.
pub fn majority(reports: &BTreeMap<ReplicaId, Checksum>) -> Option<Checksum> {
    let mut counts: HashMap<&Checksum, usize> = HashMap::new();
    for checksum in reports.values() {
        *counts.entry(checksum).or_default() += 1;
    }
    counts
        .into_iter()
        .find(|(_, n)| n * 2 > reports.len())
        .map(|(c, _)| c.clone())
}

/// A replica whose report disagreed with the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// The file.
    pub filename: String,
    /// The replica.
    pub replica: ReplicaId,
    /// What it reported.
    pub reported: Checksum,
    /// What it should hold.
    pub expected: Checksum,
}

/// An operator-visible consistency failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyFailure {
    /// The file.
    pub filename: String,
    /// The replica, when the failure is tied to one.
    pub replica: Option<ReplicaId>,
    /// Correction attempts made.
    pub attempts: u32,
    /// What went wrong.
    pub reason: String,
}

impl ConsistencyFailure {
    /// The failure as an error value.
    pub fn to_error(&self) -> ReplError {
        match &self.replica {
            Some(replica) => ReplError::CorrectionFailed {
                filename: self.filename.clone(),
                replica: replica.clone(),
                attempts: self.attempts,
                reason: self.reason.clone(),
            },
            None => ReplError::NoAuthority {
                filename: self.filename.clone(),
                reason: self.reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CorrectionState {
    Pending,
    Sent(MessageId),
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
struct Correction {
    reported: Checksum,
    attempts: u32,
    state: CorrectionState,
}

#[derive(Debug)]
struct Investigation {
    state: FileState,
    requested: BTreeSet<ReplicaId>,
    reports: BTreeMap<ReplicaId, Checksum>,
    expected: Option<Checksum>,
    corrections: BTreeMap<ReplicaId, Correction>,
}

impl Investigation {
    fn new() -> Self {
        Self {
            state: FileState::Requested,
            requested: BTreeSet::new(),
            reports: BTreeMap::new(),
            expected: None,
            corrections: BTreeMap::new(),
        }
    }

    fn settle(&mut self, filename: &str) {
        let all_acked = self
            .corrections
            .values()
            .all(|c| c.state == CorrectionState::Acked);
        let any_failed = self
            .corrections
            .values()
            .any(|c| c.state == CorrectionState::Failed);
        let any_open = self
            .corrections
            .values()
            .any(|c| matches!(c.state, CorrectionState::Pending | CorrectionState::Sent(_)));
        if all_acked {
            info!(file = filename, "corrected");
            self.state = FileState::Corrected;
        } else if any_failed && !any_open {
            self.state = FileState::CorrectionFailed;
        }
    }
}

#[derive(Default)]
struct CheckerState {
    files: BTreeMap<String, Investigation>,
    in_flight: HashMap<MessageId, (String, ReplicaId)>,
    failures: VecDeque<ConsistencyFailure>,
}

fn push_failure(failures: &mut VecDeque<ConsistencyFailure>, failure: ConsistencyFailure) {
    if failures.len() >= MAX_FAILURES {
        if let Some(old) = failures.pop_front() {
            warn!(file = %old.filename, "operator failure dropped");
        }
    }
    failures.push_back(failure);
}

/// Runs the request, compare and correct cycle per file.
pub struct ConsistencyChecker {
    clients: BTreeMap<ReplicaId, Arc<dyn ReplicaClient>>,
    max_attempts: u32,
    state: Mutex<CheckerState>,
}

impl ConsistencyChecker {
    /// Create a checker over the configured clients. `max_attempts` bounds
    /// the corrections sent per divergent replica.
    pub fn new(
        clients: impl IntoIterator<Item = Arc<dyn ReplicaClient>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.replica().id().clone(), c))
                .collect(),
            max_attempts: max_attempts.max(1),
            state: Mutex::new(CheckerState::default()),
        }
    }

    fn client(&self, replica: &ReplicaId) -> Result<&Arc<dyn ReplicaClient>> {
        self.clients
            .get(replica)
            .ok_or_else(|| ReplError::UnknownReplica {
                replica: replica.clone(),
            })
    }

    /// Ask replicas for a file's checksum. Starts a fresh investigation.
    /// Returns the messages that were sent, for correlation.
    pub fn request(&self, filename: &str, replicas: &[ReplicaId]) -> Result<Vec<(ReplicaId, Message)>> {
        if filename.trim().is_empty() {
            return Err(ReplError::invalid("filename", "must not be empty"));
        }
        if replicas.is_empty() {
            return Err(ReplError::invalid("replicas", "no replica to ask"));
        }
        let clients = replicas
            .iter()
            .map(|r| self.client(r).map(|c| (r.clone(), Arc::clone(c))))
            .collect::<Result<Vec<_>>>()?;

        let mut investigation = Investigation::new();
        let mut sent = Vec::with_capacity(clients.len());
        for (replica, client) in clients {
            match client.get_checksum(filename) {
                Ok(msg) => {
                    investigation.requested.insert(replica.clone());
                    sent.push((replica, msg));
                }
                Err(e @ ReplError::ArgumentInvalid { .. }) => return Err(e),
                Err(e) => warn!(file = filename, replica = %replica, error = %e, "checksum request not sent"),
            }
        }
        debug!(file = filename, asked = sent.len(), "checksums requested");
        lock(&self.state)
            .files
            .insert(filename.to_string(), investigation);
        Ok(sent)
    }

    /// Record one replica's reported checksum.
    pub fn record_report(&self, filename: &str, replica: &ReplicaId, checksum: Checksum) -> Result<()> {
        if filename.trim().is_empty() {
            return Err(ReplError::invalid("filename", "must not be empty"));
        }
        let mut state = lock(&self.state);
        let investigation = state
            .files
            .entry(filename.to_string())
            .or_insert_with(Investigation::new);
        investigation.reports.insert(replica.clone(), checksum);
        Ok(())
    }

    /// Record a reply to a checksum request sent to `replica`.
    /// Returns true when it carried a checksum.
    pub fn record_reply(&self, replica: &ReplicaId, msg: &Message) -> Result<bool> {
        match msg.reply() {
            Some(Reply::Checksum { filename, checksum }) if msg.is_ok() => {
                self.record_report(filename, replica, checksum.clone())?;
                Ok(true)
            }
            _ => {
                debug!(replica = %replica, msg = %msg, "no checksum in reply");
                Ok(false)
            }
        }
    }

    /// Compare the recorded reports against an authority.
    pub fn compare(&self, filename: &str, authority: &Authority) -> Result<FileState> {
        let mut state = lock(&self.state);
        let CheckerState {
            files, failures, ..
        } = &mut *state;
        let investigation = files
            .get_mut(filename)
            .ok_or_else(|| ReplError::invalid("filename", format!("{} is not under investigation", filename)))?;
        if investigation.reports.is_empty() {
            return Err(ReplError::NoAuthority {
                filename: filename.to_string(),
                reason: "no replica reported a checksum".to_string(),
            });
        }

        let expected = match authority {
            Authority::Reference(c) => c.clone(),
            Authority::Majority => match majority(&investigation.reports) {
                Some(c) => c,
                None => {
                    let reason = format!(
                        "no strict majority among {} reports",
                        investigation.reports.len()
                    );
                    error!(file = filename, reports = ?investigation.reports, "{}", reason);
                    push_failure(
                        failures,
                        ConsistencyFailure {
                            filename: filename.to_string(),
                            replica: None,
                            attempts: 0,
                            reason: reason.clone(),
                        },
                    );
                    return Err(ReplError::NoAuthority {
                        filename: filename.to_string(),
                        reason,
                    });
                }
            },
        };
        for silent in investigation
            .requested
            .iter()
            .filter(|r| !investigation.reports.contains_key(*r))
        {
            warn!(file = filename, replica = %silent, "no checksum reported");
        }
        investigation.state = FileState::Compared;
        investigation.corrections.clear();
        for (replica, reported) in &investigation.reports {
            if *reported != expected {
                warn!(file = filename, replica = %replica, reported = %reported, expected = %expected, "checksum diverged");
                investigation.corrections.insert(
                    replica.clone(),
                    Correction {
                        reported: reported.clone(),
                        attempts: 0,
                        state: CorrectionState::Pending,
                    },
                );
            }
        }
        investigation.expected = Some(expected);
        investigation.state = if investigation.corrections.is_empty() {
            FileState::Consistent
        } else {
            FileState::Diverged
        };
        debug!(file = filename, state = %investigation.state, "compared");
        Ok(investigation.state)
    }

    /// Record a divergence found outside the request cycle, e.g. by a sweep.
    pub fn mark_divergent(
        &self,
        filename: &str,
        replica: &ReplicaId,
        reported: Checksum,
        expected: Checksum,
    ) -> Result<()> {
        self.client(replica)?;
        let mut state = lock(&self.state);
        let investigation = state
            .files
            .entry(filename.to_string())
            .or_insert_with(Investigation::new);
        investigation.reports.insert(replica.clone(), reported.clone());
        investigation.expected = Some(expected);
        investigation.corrections.insert(
            replica.clone(),
            Correction {
                reported,
                attempts: 0,
                state: CorrectionState::Pending,
            },
        );
        investigation.state = FileState::Diverged;
        Ok(())
    }

    /// Send one `Correct` to every divergent replica that has no correction in
    /// flight. Replicas that were already corrected or gave up are skipped.
    ///
    /// Bit archives are repaired from `replacement`, which must name the file
    /// and hash to the expected checksum. Without one, divergent bit archives
    /// cannot be repaired: they fail at once and are reported to the operator.
    pub fn send_corrections(&self, filename: &str, replacement: Option<FileRef>) -> Result<Vec<Message>> {
        let mut state = lock(&self.state);
        let CheckerState {
            files,
            in_flight,
            failures,
        } = &mut *state;
        let investigation = files
            .get_mut(filename)
            .ok_or_else(|| ReplError::invalid("filename", format!("{} is not under investigation", filename)))?;
        if !matches!(
            investigation.state,
            FileState::Diverged | FileState::CorrectionSent
        ) {
            return Err(ReplError::invalid(
                "filename",
                format!("{} is {}, not diverged", filename, investigation.state),
            ));
        }
        let expected = investigation
            .expected
            .clone()
            .ok_or_else(|| ReplError::invalid("filename", "no authoritative checksum chosen"))?;

        if let Some(file) = &replacement {
            if file.name != filename {
                return Err(ReplError::invalid(
                    "replacement",
                    format!("names {} instead of {}", file.name, filename),
                ));
            }
            if digest(&file.content) != expected {
                return Err(ReplError::invalid(
                    "replacement",
                    format!("content does not hash to {}", expected),
                ));
            }
        }

        let pending: Vec<ReplicaId> = investigation
            .corrections
            .iter()
            .filter(|(_, c)| c.state == CorrectionState::Pending)
            .map(|(r, _)| r.clone())
            .collect();
        let clients = pending
            .iter()
            .map(|r| self.client(r).map(Arc::clone))
            .collect::<Result<Vec<_>>>()?;

        let mut sent = Vec::with_capacity(pending.len());
        for (replica, client) in pending.into_iter().zip(clients) {
            let Some(correction) = investigation.corrections.get_mut(&replica) else {
                continue;
            };
            let replacement = match (client.kind(), &replacement) {
                (ReplicaKind::BitArchive, Some(file)) => Some(file.clone()),
                (ReplicaKind::BitArchive, None) => {
                    let reason = "no clean copy to repair from";
                    error!(file = filename, replica = %replica, reason, "correction failed");
                    correction.state = CorrectionState::Failed;
                    push_failure(
                        failures,
                        ConsistencyFailure {
                            filename: filename.to_string(),
                            replica: Some(replica.clone()),
                            attempts: correction.attempts,
                            reason: reason.to_string(),
                        },
                    );
                    continue;
                }
                (ReplicaKind::ChecksumArchive, _) => None,
            };
            correction.attempts += 1;
            match client.correct(filename, &expected, &correction.reported, replacement) {
                Ok(msg) => {
                    info!(file = filename, replica = %replica, attempt = correction.attempts, "correction sent");
                    correction.state = CorrectionState::Sent(msg.id().clone());
                    in_flight.insert(msg.id().clone(), (filename.to_string(), replica.clone()));
                    sent.push(msg);
                }
                Err(e) => {
                    fail_attempt(filename, &replica, correction, self.max_attempts, &e.to_string(), failures);
                }
            }
        }
        if !sent.is_empty() {
            investigation.state = FileState::CorrectionSent;
        }
        investigation.settle(filename);
        Ok(sent)
    }

    /// Fold a reply to a `Correct` message. Returns the file's new state, or
    /// `None` if the message is not a tracked correction.
    pub fn handle_correction_reply(&self, msg: &Message) -> Option<FileState> {
        let mut state = lock(&self.state);
        let CheckerState {
            files,
            in_flight,
            failures,
        } = &mut *state;
        let (filename, replica) = in_flight.remove(msg.id())?;
        let investigation = files.get_mut(&filename)?;
        let expected = investigation.expected.clone();
        let correction = investigation.corrections.get_mut(&replica)?;

        let acked = match (msg.is_ok(), msg.reply()) {
            (true, Some(Reply::Corrected { checksum, .. })) => Some(checksum) == expected.as_ref(),
            _ => false,
        };
        if acked {
            info!(file = %filename, replica = %replica, "correction acknowledged");
            correction.state = CorrectionState::Acked;
            investigation.reports.remove(&replica);
        } else {
            let reason = msg
                .error_text()
                .unwrap_or("acknowledged with the wrong checksum")
                .to_string();
            fail_attempt(&filename, &replica, correction, self.max_attempts, &reason, failures);
        }
        investigation.settle(&filename);
        Some(investigation.state)
    }

    /// Count corrections still in flight for a file as failed attempts, e.g.
    /// after a reply timeout.
    pub fn expire_corrections(&self, filename: &str) -> Option<FileState> {
        let mut state = lock(&self.state);
        let CheckerState {
            files,
            in_flight,
            failures,
        } = &mut *state;
        let investigation = files.get_mut(filename)?;
        for (replica, correction) in investigation.corrections.iter_mut() {
            let CorrectionState::Sent(id) = correction.state.clone() else {
                continue;
            };
            in_flight.remove(&id);
            fail_attempt(filename, replica, correction, self.max_attempts, "no reply", failures);
        }
        investigation.settle(filename);
        Some(investigation.state)
    }

    /// True while some correction for the file can still be sent.
    pub fn has_pending(&self, filename: &str) -> bool {
        lock(&self.state).files.get(filename).is_some_and(|i| {
            i.corrections
                .values()
                .any(|c| c.state == CorrectionState::Pending)
        })
    }

    /// Current state of a file.
    pub fn state(&self, filename: &str) -> Option<FileState> {
        lock(&self.state).files.get(filename).map(|i| i.state)
    }

    /// Authoritative checksum chosen for a file.
    pub fn expected(&self, filename: &str) -> Option<Checksum> {
        lock(&self.state)
            .files
            .get(filename)
            .and_then(|i| i.expected.clone())
    }

    /// Replicas still holding a divergent copy, for audit.
    pub fn divergence_set(&self) -> Vec<Divergence> {
        let state = lock(&self.state);
        let mut out = Vec::new();
        for (filename, investigation) in &state.files {
            let Some(expected) = &investigation.expected else {
                continue;
            };
            for (replica, correction) in &investigation.corrections {
                if correction.state != CorrectionState::Acked {
                    out.push(Divergence {
                        filename: filename.clone(),
                        replica: replica.clone(),
                        reported: correction.reported.clone(),
                        expected: expected.clone(),
                    });
                }
            }
        }
        out
    }

    /// Operator-visible failures not yet taken, oldest first.
    pub fn failures(&self) -> Vec<ConsistencyFailure> {
        lock(&self.state).failures.iter().cloned().collect()
    }

    /// Hand the operator-visible failures over and clear them.
    pub fn take_failures(&self) -> Vec<ConsistencyFailure> {
        lock(&self.state).failures.drain(..).collect()
    }

    /// Number of files under investigation.
    pub fn tracked(&self) -> usize {
        lock(&self.state).files.len()
    }

    /// Drop an investigation and any correction still in flight for it.
    /// Replies to those corrections are ignored afterwards.
    pub fn forget(&self, filename: &str) -> bool {
        let mut state = lock(&self.state);
        state.in_flight.retain(|_, (file, _)| file != filename);
        state.files.remove(filename).is_some()
    }
}

fn fail_attempt(
    filename: &str,
    replica: &ReplicaId,
    correction: &mut Correction,
    max_attempts: u32,
    reason: &str,
    failures: &mut VecDeque<ConsistencyFailure>,
) {
    if correction.attempts >= max_attempts {
        error!(file = filename, replica = %replica, attempts = correction.attempts, reason, "correction failed");
        correction.state = CorrectionState::Failed;
        push_failure(
            failures,
            ConsistencyFailure {
                filename: filename.to_string(),
                replica: Some(replica.clone()),
                attempts: correction.attempts,
                reason: reason.to_string(),
            },
        );
    } else {
        warn!(file = filename, replica = %replica, attempt = correction.attempts, reason, "correction attempt failed, will retry");
        correction.state = CorrectionState::Pending;
    }
}

/// A discrepancy found by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepFinding {
    /// In the authoritative listing only.
    Missing {
        /// The file.
        filename: String,
        /// Its authoritative checksum.
        expected: Checksum,
    },
    /// In the replica's listing only.
    Unexpected {
        /// The file.
        filename: String,
        /// The checksum the replica reported.
        reported: Checksum,
    },
    /// In both, with different checksums.
    Mismatch {
        /// The file.
        filename: String,
        /// Authoritative checksum.
        expected: Checksum,
        /// Reported checksum.
        reported: Checksum,
    },
}

impl SweepFinding {
    /// The file concerned.
    pub fn filename(&self) -> &str {
        match self {
            SweepFinding::Missing { filename, .. }
            | SweepFinding::Unexpected { filename, .. }
            | SweepFinding::Mismatch { filename, .. } => filename,
        }
    }
}

/// A discrepancy between two filename listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFinding {
    /// In the authoritative listing only.
    Missing(String),
    /// In the replica's listing only.
    Unexpected(String),
}

/// Something with a sort key.
pub trait SweepKey {
    /// The key listings are sorted by.
    fn key(&self) -> &str;
}

impl SweepKey for ChecksumRecord {
    fn key(&self) -> &str {
        &self.filename
    }
}

impl SweepKey for String {
    fn key(&self) -> &str {
        self
    }
}

/// One step of a merge-join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Joined<T> {
    /// Only on the left.
    Left(T),
    /// Only on the right.
    Right(T),
    /// On both sides.
    Both(T, T),
}

struct Side<I, T> {
    iter: I,
    head: Option<T>,
    last: Option<String>,
    line: usize,
    name: &'static str,
}

impl<I, T> Side<I, T>
where
    I: Iterator<Item = Result<T>>,
    T: SweepKey,
{
    fn fill(&mut self) -> Result<()> {
        if self.head.is_some() {
            return Ok(());
        }
        let Some(item) = self.iter.next() else {
            return Ok(());
        };
        let item = item?;
        self.line += 1;
        if let Some(last) = &self.last {
            if item.key() <= last.as_str() {
                return Err(ReplError::Listing {
                    line: self.line,
                    reason: format!(
                        "{} listing not strictly sorted: {} after {}",
                        self.name,
                        item.key(),
                        last
                    ),
                });
            }
        }
        self.last = Some(item.key().to_string());
        self.head = Some(item);
        Ok(())
    }
}

/// Merge-join of two sorted streams. Stops after the first error.
pub struct SweepIter<A, B, T>
where
    A: Iterator<Item = Result<T>>,
    B: Iterator<Item = Result<T>>,
{
    left: Side<A, T>,
    right: Side<B, T>,
    failed: bool,
}

impl<A, B, T> SweepIter<A, B, T>
where
    A: Iterator<Item = Result<T>>,
    B: Iterator<Item = Result<T>>,
    T: SweepKey,
{
    /// Join `left` (authoritative) with `right` (reported).
    pub fn new(left: A, right: B) -> Self {
        Self {
            left: Side {
                iter: left,
                head: None,
                last: None,
                line: 0,
                name: "authoritative",
            },
            right: Side {
                iter: right,
                head: None,
                last: None,
                line: 0,
                name: "reported",
            },
            failed: false,
        }
    }
}

impl<A, B, T> Iterator for SweepIter<A, B, T>
where
    A: Iterator<Item = Result<T>>,
    B: Iterator<Item = Result<T>>,
    T: SweepKey,
{
    type Item = Result<Joined<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.left.fill().and_then(|_| self.right.fill()) {
            self.failed = true;
            return Some(Err(e));
        }
        match (self.left.head.take(), self.right.head.take()) {
            (None, None) => None,
            (Some(a), None) => Some(Ok(Joined::Left(a))),
            (None, Some(b)) => Some(Ok(Joined::Right(b))),
            (Some(a), Some(b)) => match a.key().cmp(b.key()) {
                Ordering::Less => {
                    self.right.head = Some(b);
                    Some(Ok(Joined::Left(a)))
                }
                Ordering::Greater => {
                    self.left.head = Some(a);
                    Some(Ok(Joined::Right(b)))
                }
                Ordering::Equal => Some(Ok(Joined::Both(a, b))),
            },
        }
    }
}

/// Compare a replica's checksum listing with the authoritative one. Both
/// must be sorted by filename.
pub fn sweep<A, B>(authoritative: A, reported: B) -> impl Iterator<Item = Result<SweepFinding>>
where
    A: IntoIterator<Item = Result<ChecksumRecord>>,
    B: IntoIterator<Item = Result<ChecksumRecord>>,
{
    SweepIter::new(authoritative.into_iter(), reported.into_iter()).filter_map(|step| match step {
        Err(e) => Some(Err(e)),
        Ok(Joined::Left(a)) => Some(Ok(SweepFinding::Missing {
            filename: a.filename,
            expected: a.checksum,
        })),
        Ok(Joined::Right(b)) => Some(Ok(SweepFinding::Unexpected {
            filename: b.filename,
            reported: b.checksum,
        })),
        Ok(Joined::Both(a, b)) if a.checksum != b.checksum => Some(Ok(SweepFinding::Mismatch {
            filename: a.filename,
            expected: a.checksum,
            reported: b.checksum,
        })),
        Ok(Joined::Both(..)) => None,
    })
}

/// Compare two sorted filename listings.
pub fn sweep_filenames<A, B>(authoritative: A, reported: B) -> impl Iterator<Item = Result<NameFinding>>
where
    A: IntoIterator<Item = Result<String>>,
    B: IntoIterator<Item = Result<String>>,
{
    SweepIter::new(authoritative.into_iter(), reported.into_iter()).filter_map(|step| match step {
        Err(e) => Some(Err(e)),
        Ok(Joined::Left(a)) => Some(Ok(NameFinding::Missing(a))),
        Ok(Joined::Right(b)) => Some(Ok(NameFinding::Unexpected(b))),
        Ok(Joined::Both(..)) => None,
    })
}
