//! Batch job fan-out and result collection.
//!
//! A job goes either to one replica or to every replica of a kind. The set of
//! expected respondents is fixed at submission. Replies are matched by job id,
//! tallied in an [`OperationOutcome`] and judged by the quorum evaluator once
//! every respondent has answered or the caller's wait runs out.
//!
//! Once a caller has awaited a job to its end the job is retired: only its
//! final outcome is kept, in a bounded list, so that late replies and
//! terminations for it are still recognised as stale.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arcgrid_bus::{
    BatchJobSpec, BatchReport, BusContext, Channel, FileFailure, FileFilter, JobId, Message,
    MessageId, MessageListener, Payload, Reply, ReplicaId, ReplicaKind,
};
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::client::{BatchJobState, ReplicaClient};
use crate::error::{ReplError, Result};
use crate::quorum::{FailureCause, OperationOutcome, QuorumPolicy, Recorded, Verdict};

/// Final outcomes kept after their jobs are retired.
const DEFAULT_RETAINED: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Compiled form of a [`FileFilter`].
#[derive(Debug, Clone)]
pub enum FilterMatcher {
    /// Matches everything.
    All,
    /// Matches one name.
    Exact(String),
    /// Matches names with a prefix.
    Prefix(String),
    /// Matches names against a regular expression (anchored).
    Pattern(Regex),
}

impl FilterMatcher {
    /// Compile a filter. A malformed pattern is an argument error.
    pub fn new(filter: &FileFilter) -> Result<Self> {
        Ok(match filter {
            FileFilter::All => FilterMatcher::All,
            FileFilter::Exact(name) => FilterMatcher::Exact(name.clone()),
            FileFilter::Prefix(prefix) => FilterMatcher::Prefix(prefix.clone()),
            FileFilter::Pattern(pattern) => FilterMatcher::Pattern(
                Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| ReplError::invalid("filter", format!("bad pattern: {}", e)))?,
            ),
        })
    }

    /// Whether a filename is selected.
    pub fn matches(&self, filename: &str) -> bool {
        match self {
            FilterMatcher::All => true,
            FilterMatcher::Exact(name) => name == filename,
            FilterMatcher::Prefix(prefix) => filename.starts_with(prefix.as_str()),
            FilterMatcher::Pattern(re) => re.is_match(filename),
        }
    }
}

/// Where a batch job is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTarget {
    /// One replica.
    Replica(ReplicaId),
    /// Every configured replica of a kind.
    AllOfKind(ReplicaKind),
}

/// What [`BatchJobEngine::handle_reply`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Recorded; more respondents outstanding.
    Accumulated,
    /// Recorded and the job reached a terminal state.
    Completed(BatchJobState),
    /// The job is terminal or terminating; the reply was discarded.
    Stale,
    /// Not a batch reply, or the job or pillar is not tracked.
    Unknown,
    /// The pillar had already reported.
    Duplicate,
}

/// Merged result of a finished batch job.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Job id.
    pub job_id: JobId,
    /// Terminal state.
    pub state: BatchJobState,
    /// Quorum verdict over the respondents.
    pub verdict: Verdict,
    /// Files processed across all pillars.
    pub files_processed: u64,
    /// Per-file failures across all pillars.
    pub failures: Vec<FileFailure>,
    /// Concatenated output, in replica id order.
    pub output: Vec<u8>,
    /// Per-pillar reports.
    pub reports: BTreeMap<ReplicaId, BatchReport>,
    /// Pillars that failed, and why.
    pub pillar_failures: BTreeMap<ReplicaId, FailureCause>,
}

impl BatchOutcome {
    /// Output as UTF-8 text, lossy.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

struct TrackedJob {
    spec: BatchJobSpec,
    state: BatchJobState,
    targets: Vec<ReplicaId>,
    outcome: OperationOutcome,
    reports: BTreeMap<ReplicaId, BatchReport>,
    messages: HashMap<MessageId, ReplicaId>,
}

impl TrackedJob {
    fn set_state(&mut self, job_id: &JobId, next: BatchJobState) -> bool {
        if self.state.can_transition(next) {
            debug!(job = %job_id, from = %self.state, to = %next, "batch job state");
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Move to Done or Failed if the tally is complete.
    fn settle(&mut self, job_id: &JobId) -> Option<BatchJobState> {
        let next = match self.outcome.verdict() {
            Verdict::Pending => return None,
            Verdict::Accept => BatchJobState::Done,
            Verdict::Reject(reason) => {
                warn!(job = %job_id, reason = ?reason, "batch job rejected");
                BatchJobState::Failed
            }
        };
        self.set_state(job_id, next);
        info!(job = %job_id, spec = self.spec.name(), state = %self.state, "batch job finished");
        Some(self.state)
    }

    fn snapshot(&self, job_id: &JobId) -> BatchOutcome {
        let mut files_processed = 0;
        let mut failures = Vec::new();
        let mut output = Vec::new();
        for report in self.reports.values() {
            files_processed += report.files_processed;
            failures.extend(report.failures.iter().cloned());
            output.extend_from_slice(&report.output);
        }
        BatchOutcome {
            job_id: job_id.clone(),
            state: self.state,
            verdict: self.outcome.verdict(),
            files_processed,
            failures,
            output,
            reports: self.reports.clone(),
            pillar_failures: self.outcome.failed().clone(),
        }
    }
}

/// Submits batch jobs and collects their replies.
pub struct BatchJobEngine {
    ctx: BusContext,
    clients: BTreeMap<ReplicaId, Arc<dyn ReplicaClient>>,
    reply_channel: Channel,
    jobs: Mutex<HashMap<JobId, TrackedJob>>,
    retired: Mutex<VecDeque<BatchOutcome>>,
    max_retired: usize,
    changed: Notify,
}

impl BatchJobEngine {
    /// Create an engine over the configured clients. Replies are expected on
    /// `reply_channel`.
    pub fn new(
        ctx: BusContext,
        clients: impl IntoIterator<Item = Arc<dyn ReplicaClient>>,
        reply_channel: Channel,
    ) -> Self {
        Self::with_retention(ctx, clients, reply_channel, DEFAULT_RETAINED)
    }

    /// Like [`new`](Self::new), keeping at most `max_retired` final outcomes
    /// of retired jobs.
    pub fn with_retention(
        ctx: BusContext,
        clients: impl IntoIterator<Item = Arc<dyn ReplicaClient>>,
        reply_channel: Channel,
        max_retired: usize,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| (c.replica().id().clone(), c))
            .collect();
        Self {
            ctx,
            clients,
            reply_channel,
            jobs: Mutex::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
            max_retired: max_retired.max(1),
            changed: Notify::new(),
        }
    }

    fn retired_outcome(&self, job_id: &JobId) -> Option<BatchOutcome> {
        lock(&self.retired)
            .iter()
            .find(|o| &o.job_id == job_id)
            .cloned()
    }

    fn is_retired(&self, job_id: &JobId) -> bool {
        lock(&self.retired).iter().any(|o| &o.job_id == job_id)
    }

    /// Drop a terminal job, keeping only its final outcome.
    fn retire(&self, jobs: &mut HashMap<JobId, TrackedJob>, job_id: &JobId) -> Option<BatchOutcome> {
        let job = jobs.remove(job_id)?;
        let outcome = job.snapshot(job_id);
        let mut retired = lock(&self.retired);
        if retired.len() >= self.max_retired {
            if let Some(old) = retired.pop_front() {
                debug!(job = %old.job_id, "retired batch outcome dropped");
            }
        }
        retired.push_back(outcome.clone());
        debug!(job = %job_id, "batch job retired");
        Some(outcome)
    }

    /// Channel the engine expects replies on.
    pub fn reply_channel(&self) -> &Channel {
        &self.reply_channel
    }

    fn resolve(&self, target: &BatchTarget) -> Result<Vec<Arc<dyn ReplicaClient>>> {
        let targets: Vec<_> = match target {
            BatchTarget::Replica(id) => vec![self
                .clients
                .get(id)
                .cloned()
                .ok_or_else(|| ReplError::UnknownReplica {
                    replica: id.clone(),
                })?],
            BatchTarget::AllOfKind(kind) => self
                .clients
                .values()
                .filter(|c| c.kind() == *kind)
                .cloned()
                .collect(),
        };
        if targets.is_empty() {
            return Err(ReplError::invalid("target", "no replica matches the target"));
        }
        Ok(targets)
    }

    /// Send a job. The expected respondents are fixed here.
    pub fn submit(
        &self,
        spec: BatchJobSpec,
        filter: FileFilter,
        target: BatchTarget,
        max_failures: usize,
    ) -> Result<JobId> {
        let targets = self.resolve(&target)?;
        let ids: Vec<ReplicaId> = targets.iter().map(|c| c.replica().id().clone()).collect();
        let policy = QuorumPolicy::new(ids.clone(), max_failures)?;
        FilterMatcher::new(&filter)?;

        let job_id = JobId::from(self.ctx.bus.ids().next_id());
        lock(&self.jobs).insert(
            job_id.clone(),
            TrackedJob {
                spec: spec.clone(),
                state: BatchJobState::Submitted,
                targets: ids,
                outcome: OperationOutcome::new(policy),
                reports: BTreeMap::new(),
                messages: HashMap::new(),
            },
        );
        info!(job = %job_id, spec = spec.name(), dest = ?target, "batch job submitted");

        let mut sent = Vec::with_capacity(targets.len());
        for client in &targets {
            let replica = client.replica().id().clone();
            let result = client.run_batch_job(
                job_id.clone(),
                spec.clone(),
                &self.reply_channel,
                Some(filter.clone()),
            );
            sent.push((replica, result));
        }

        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.get_mut(&job_id) {
            for (replica, result) in sent {
                let cause = match result {
                    Ok(handle) => {
                        job.messages.insert(handle.message_id, replica.clone());
                        if handle.state != BatchJobState::Failed {
                            continue;
                        }
                        FailureCause::Reported("batch jobs are not supported".to_string())
                    }
                    Err(e) => FailureCause::Unreachable(e.to_string()),
                };
                warn!(job = %job_id, replica = %replica, cause = ?cause, "batch job not started");
                let _ = job.outcome.record_failure(&replica, cause);
            }
            if job.settle(&job_id).is_some() {
                self.changed.notify_waiters();
            }
        }
        Ok(job_id)
    }

    /// Fold one reply into its job.
    pub fn handle_reply(&self, msg: &Message) -> ReplyDisposition {
        let disposition = match msg.payload() {
            Payload::RunBatch { job_id, .. } => self.handle_batch_reply(job_id, msg),
            Payload::TerminateBatch { job_id } => self.handle_termination_ack(job_id, msg),
            _ => ReplyDisposition::Unknown,
        };
        if matches!(disposition, ReplyDisposition::Completed(_)) {
            self.changed.notify_waiters();
        }
        disposition
    }

    fn handle_batch_reply(&self, job_id: &JobId, msg: &Message) -> ReplyDisposition {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(job_id) else {
            if self.is_retired(job_id) {
                debug!(job = %job_id, msg = %msg, "reply for retired batch job discarded");
                return ReplyDisposition::Stale;
            }
            debug!(job = %job_id, msg = %msg, "reply for unknown batch job");
            return ReplyDisposition::Unknown;
        };
        if job.state.is_terminal() || job.state == BatchJobState::Terminating {
            debug!(job = %job_id, state = %job.state, msg = %msg, "stale batch reply discarded");
            return ReplyDisposition::Stale;
        }

        let report = match msg.reply() {
            Some(Reply::Batch(report)) => Some(report.clone()),
            _ => None,
        };
        let pillar = match report
            .as_ref()
            .map(|r| r.replica.clone())
            .or_else(|| job.messages.get(msg.id()).cloned())
        {
            Some(p) => p,
            None => {
                warn!(job = %job_id, msg = %msg, "batch reply from unidentified pillar");
                return ReplyDisposition::Unknown;
            }
        };

        let recorded = if msg.is_ok() && report.is_some() {
            job.outcome.record_success(&pillar)
        } else {
            let text = msg.error_text().unwrap_or("reply without a batch report");
            job.outcome
                .record_failure(&pillar, FailureCause::Reported(text.to_string()))
        };
        match recorded {
            Ok(Recorded::New) => {}
            Ok(Recorded::Duplicate) | Ok(Recorded::Conflict) => return ReplyDisposition::Duplicate,
            Err(e) => {
                warn!(job = %job_id, error = %e, "batch reply ignored");
                return ReplyDisposition::Unknown;
            }
        }
        if let Some(report) = report {
            job.reports.insert(pillar, report);
        }
        job.set_state(job_id, BatchJobState::Running);

        match job.settle(job_id) {
            Some(state) => ReplyDisposition::Completed(state),
            None => ReplyDisposition::Accumulated,
        }
    }

    fn handle_termination_ack(&self, job_id: &JobId, msg: &Message) -> ReplyDisposition {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(job_id) else {
            if self.is_retired(job_id) {
                return ReplyDisposition::Stale;
            }
            return ReplyDisposition::Unknown;
        };
        let acked = msg.is_ok() && matches!(msg.reply(), Some(Reply::Terminated { .. }));
        if acked && job.state == BatchJobState::Terminating {
            job.set_state(job_id, BatchJobState::Done);
            info!(job = %job_id, "batch job terminated");
            return ReplyDisposition::Completed(BatchJobState::Done);
        }
        debug!(job = %job_id, state = %job.state, msg = %msg, "termination reply ignored");
        ReplyDisposition::Stale
    }

    /// Best-effort termination.
    ///
    /// A terminal or retired job is left alone. An in-flight job moves to
    /// `Terminating` and stops accumulating results. A job this engine never
    /// saw is still broadcast to every bit archive, since it may be running
    /// anywhere.
    pub fn terminate(&self, job_id: &JobId) -> Result<()> {
        if job_id.as_str().trim().is_empty() {
            return Err(ReplError::invalid("job_id", "must not be empty"));
        }
        let targets: Vec<Arc<dyn ReplicaClient>> = {
            let mut jobs = lock(&self.jobs);
            match jobs.get_mut(job_id) {
                Some(job) if job.state.is_terminal() => {
                    debug!(job = %job_id, state = %job.state, "terminate on finished job ignored");
                    return Ok(());
                }
                Some(job) => {
                    job.set_state(job_id, BatchJobState::Terminating);
                    job.targets
                        .iter()
                        .filter_map(|id| self.clients.get(id).cloned())
                        .collect()
                }
                None if self.is_retired(job_id) => {
                    debug!(job = %job_id, "terminate on retired job ignored");
                    return Ok(());
                }
                None => self
                    .clients
                    .values()
                    .filter(|c| c.kind() == ReplicaKind::BitArchive)
                    .cloned()
                    .collect(),
            }
        };

        for client in targets {
            if let Err(e) = client.terminate_batch_job(job_id) {
                warn!(job = %job_id, replica = %client.replica().id(), error = %e, "terminate not delivered");
            }
        }
        Ok(())
    }

    /// Current state of a job, retired jobs included.
    pub fn state(&self, job_id: &JobId) -> Option<BatchJobState> {
        if let Some(job) = lock(&self.jobs).get(job_id) {
            return Some(job.state);
        }
        self.retired_outcome(job_id).map(|o| o.state)
    }

    /// Merged results so far, or the final outcome of a retired job.
    pub fn outcome(&self, job_id: &JobId) -> Result<BatchOutcome> {
        if let Some(job) = lock(&self.jobs).get(job_id) {
            return Ok(job.snapshot(job_id));
        }
        self.retired_outcome(job_id)
            .ok_or_else(|| ReplError::UnknownJob {
                job_id: job_id.to_string(),
            })
    }

    /// Number of jobs not yet retired.
    pub fn tracked(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Number of retired outcomes kept.
    pub fn retired(&self) -> usize {
        lock(&self.retired).len()
    }

    /// Wait until the job is terminal, then retire it. On timeout
    /// outstanding pillars become `NoResponse` failures and the verdict is
    /// final.
    pub async fn await_outcome(&self, job_id: &JobId, timeout: Duration) -> Result<BatchOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut jobs = lock(&self.jobs);
                let state = jobs.get(job_id).map(|j| j.state);
                match state {
                    Some(state) if state.is_terminal() => {
                        if let Some(outcome) = self.retire(&mut jobs, job_id) {
                            return Ok(outcome);
                        }
                    }
                    Some(_) => {}
                    None => {
                        return self.retired_outcome(job_id).ok_or_else(|| {
                            ReplError::UnknownJob {
                                job_id: job_id.to_string(),
                            }
                        })
                    }
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return self.expire(job_id);
            }
        }
    }

    fn expire(&self, job_id: &JobId) -> Result<BatchOutcome> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(job_id) else {
            return self.retired_outcome(job_id).ok_or_else(|| ReplError::UnknownJob {
                job_id: job_id.to_string(),
            });
        };
        if job.state == BatchJobState::Terminating {
            job.set_state(job_id, BatchJobState::Done);
        } else if !job.state.is_terminal() {
            let silent = job.outcome.expire();
            warn!(job = %job_id, silent = ?silent, "batch job timed out");
            job.settle(job_id);
        }
        self.retire(&mut jobs, job_id).ok_or_else(|| ReplError::UnknownJob {
            job_id: job_id.to_string(),
        })
    }
}

/// Listener feeding replies into a shared [`BatchJobEngine`].
pub struct BatchReplyListener {
    engine: Arc<BatchJobEngine>,
}

impl BatchReplyListener {
    /// Wrap an engine.
    pub fn new(engine: Arc<BatchJobEngine>) -> Self {
        Self { engine }
    }
}

impl MessageListener for BatchReplyListener {
    fn on_message(&self, msg: Message) {
        let disposition = self.engine.handle_reply(&msg);
        debug!(msg = %msg, disposition = ?disposition, "batch reply handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{client_for, Replica};
    use arcgrid_bus::RecordingTransport;

    struct Fixture {
        recorder: Arc<RecordingTransport>,
        ctx: BusContext,
        engine: BatchJobEngine,
    }

    fn fixture() -> Fixture {
        fixture_retaining(DEFAULT_RETAINED)
    }

    fn fixture_retaining(max_retired: usize) -> Fixture {
        let recorder = Arc::new(RecordingTransport::new());
        let ctx = BusContext::new("test", recorder.clone());
        let reply = ctx.channels.reply_to("batch");
        let clients: Vec<_> = [
            ("one", ReplicaKind::BitArchive),
            ("two", ReplicaKind::BitArchive),
            ("three", ReplicaKind::BitArchive),
            ("cs", ReplicaKind::ChecksumArchive),
        ]
        .into_iter()
        .map(|(id, kind)| {
            let replica = Replica::new(ReplicaId::new(id), kind, &ctx.channels);
            client_for(replica, ctx.clone(), reply.clone())
        })
        .collect();
        let engine = BatchJobEngine::with_retention(ctx.clone(), clients, reply, max_retired);
        Fixture {
            recorder,
            ctx,
            engine,
        }
    }

    /// Replies as a pillar would: the request with a batch report attached.
    fn reply_from(f: &Fixture, replica: &str, processed: u64, output: &str) -> Message {
        let monitor = f.ctx.channels.monitor(&ReplicaId::new(replica));
        let mut msg = f.recorder.sent_to(&monitor).pop().unwrap();
        let job_id = match msg.payload() {
            Payload::RunBatch { job_id, .. } => job_id.clone(),
            other => panic!("unexpected payload {:?}", other),
        };
        msg.set_reply(Reply::Batch(BatchReport {
            job_id,
            replica: ReplicaId::new(replica),
            files_processed: processed,
            failures: Vec::new(),
            output: output.as_bytes().to_vec(),
        }))
        .unwrap();
        msg
    }

    #[test]
    fn test_filter_matcher() {
        assert!(FilterMatcher::new(&FileFilter::All).unwrap().matches("x"));
        let exact = FilterMatcher::new(&FileFilter::Exact("a.warc".into())).unwrap();
        assert!(exact.matches("a.warc") && !exact.matches("a.warc.gz"));
        let prefix = FilterMatcher::new(&FileFilter::Prefix("2024".into())).unwrap();
        assert!(prefix.matches("2024-a") && !prefix.matches("a-2024"));
        let pattern = FilterMatcher::new(&FileFilter::Pattern(r".*\.warc".into())).unwrap();
        assert!(pattern.matches("x.warc") && !pattern.matches("x.warc.gz"));
        assert!(FilterMatcher::new(&FileFilter::Pattern("[".into())).is_err());
    }

    #[test]
    fn test_submit_to_all_of_kind_snapshots_respondents() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::AllOfKind(ReplicaKind::BitArchive),
                0,
            )
            .unwrap();
        assert_eq!(f.recorder.sent().len(), 3);
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Submitted));
    }

    #[test]
    fn test_submit_validates_before_sending() {
        let f = fixture();
        let unknown = f.engine.submit(
            BatchJobSpec::ListFiles,
            FileFilter::All,
            BatchTarget::Replica(ReplicaId::new("nope")),
            0,
        );
        assert!(matches!(unknown, Err(ReplError::UnknownReplica { .. })));

        let bad_policy = f.engine.submit(
            BatchJobSpec::ListFiles,
            FileFilter::All,
            BatchTarget::Replica(ReplicaId::new("one")),
            1,
        );
        assert!(bad_policy.is_err());

        let bad_filter = f.engine.submit(
            BatchJobSpec::ListFiles,
            FileFilter::Pattern("(".into()),
            BatchTarget::AllOfKind(ReplicaKind::BitArchive),
            0,
        );
        assert!(bad_filter.is_err());
        assert!(f.recorder.sent().is_empty());
    }

    #[test]
    fn test_replies_merge_into_done() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::ListFiles,
                FileFilter::All,
                BatchTarget::AllOfKind(ReplicaKind::BitArchive),
                0,
            )
            .unwrap();

        let d1 = f.engine.handle_reply(&reply_from(&f, "two", 2, "b\nc\n"));
        assert_eq!(d1, ReplyDisposition::Accumulated);
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Running));

        let dup = f.engine.handle_reply(&reply_from(&f, "two", 2, "b\nc\n"));
        assert_eq!(dup, ReplyDisposition::Duplicate);

        f.engine.handle_reply(&reply_from(&f, "one", 1, "a\n"));
        let last = f.engine.handle_reply(&reply_from(&f, "three", 0, ""));
        assert_eq!(last, ReplyDisposition::Completed(BatchJobState::Done));

        let outcome = f.engine.outcome(&job).unwrap();
        assert_eq!(outcome.files_processed, 3);
        assert_eq!(outcome.output_text(), "a\nb\nc\n");
        assert!(outcome.verdict.is_accept());
    }

    #[test]
    fn test_failure_beyond_tolerance_fails_job() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::AllOfKind(ReplicaKind::BitArchive),
                0,
            )
            .unwrap();

        let mut failed = f
            .recorder
            .sent_to(&f.ctx.channels.monitor(&ReplicaId::new("one")))
            .pop()
            .unwrap();
        failed.set_not_ok("disk offline").unwrap();
        f.engine.handle_reply(&failed);
        f.engine.handle_reply(&reply_from(&f, "two", 1, ""));
        let last = f.engine.handle_reply(&reply_from(&f, "three", 1, ""));

        assert_eq!(last, ReplyDisposition::Completed(BatchJobState::Failed));
        let outcome = f.engine.outcome(&job).unwrap();
        assert!(outcome.verdict.is_reject());
        assert!(outcome.pillar_failures.contains_key(&ReplicaId::new("one")));
    }

    #[test]
    fn test_checksum_archive_target_fails_at_submit() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::Replica(ReplicaId::new("cs")),
                0,
            )
            .unwrap();
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Failed));
    }

    #[test]
    fn test_terminate_done_job_is_noop() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::Replica(ReplicaId::new("one")),
                0,
            )
            .unwrap();
        f.engine.handle_reply(&reply_from(&f, "one", 5, ""));
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Done));

        f.recorder.clear();
        f.engine.terminate(&job).unwrap();
        f.engine.terminate(&job).unwrap();
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Done));
        assert!(f.recorder.sent().is_empty());
    }

    #[test]
    fn test_terminate_in_flight_discards_late_results() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::Replica(ReplicaId::new("one")),
                0,
            )
            .unwrap();
        let late = reply_from(&f, "one", 5, "");

        f.engine.terminate(&job).unwrap();
        assert_eq!(f.engine.state(&job), Some(BatchJobState::Terminating));
        let all = f
            .ctx
            .channels
            .all(ReplicaKind::BitArchive, &ReplicaId::new("one"));
        let mut ack = f.recorder.sent_to(&all).pop().unwrap();

        assert_eq!(f.engine.handle_reply(&late), ReplyDisposition::Stale);

        ack.set_reply(Reply::Terminated {
            job_id: job.clone(),
            replica: ReplicaId::new("one"),
        })
        .unwrap();
        assert_eq!(
            f.engine.handle_reply(&ack),
            ReplyDisposition::Completed(BatchJobState::Done)
        );
        assert_eq!(f.engine.handle_reply(&late), ReplyDisposition::Stale);
    }

    #[test]
    fn test_terminate_unknown_job_still_broadcasts() {
        let f = fixture();
        f.engine.terminate(&JobId::new("never-seen")).unwrap();
        assert_eq!(f.recorder.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_outcome_expires_silent_pillars() {
        let f = fixture();
        let job = f
            .engine
            .submit(
                BatchJobSpec::Checksum,
                FileFilter::All,
                BatchTarget::AllOfKind(ReplicaKind::BitArchive),
                1,
            )
            .unwrap();
        f.engine.handle_reply(&reply_from(&f, "one", 1, ""));
        f.engine.handle_reply(&reply_from(&f, "two", 1, ""));

        let outcome = f
            .engine
            .await_outcome(&job, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.state, BatchJobState::Done);
        assert_eq!(
            outcome.pillar_failures.get(&ReplicaId::new("three")),
            Some(&FailureCause::NoResponse)
        );
    }

    #[tokio::test]
    async fn test_awaited_jobs_are_retired_within_bounds() {
        let f = fixture_retaining(1);
        let submit = || {
            f.engine
                .submit(
                    BatchJobSpec::ListFiles,
                    FileFilter::All,
                    BatchTarget::Replica(ReplicaId::new("one")),
                    0,
                )
                .unwrap()
        };

        let first = submit();
        let first_reply = reply_from(&f, "one", 1, "a\n");
        f.engine.handle_reply(&first_reply);
        assert_eq!(f.engine.tracked(), 1);
        let outcome = f
            .engine
            .await_outcome(&first, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.output_text(), "a\n");
        assert_eq!(f.engine.tracked(), 0);
        assert_eq!(f.engine.retired(), 1);
        assert_eq!(f.engine.state(&first), Some(BatchJobState::Done));
        assert_eq!(f.engine.handle_reply(&first_reply), ReplyDisposition::Stale);

        f.recorder.clear();
        f.engine.terminate(&first).unwrap();
        assert!(f.recorder.sent().is_empty());

        let second = submit();
        f.engine.handle_reply(&reply_from(&f, "one", 1, "b\n"));
        f.engine
            .await_outcome(&second, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(f.engine.tracked(), 0);
        assert_eq!(f.engine.retired(), 1);
        assert_eq!(f.engine.state(&first), None);
        assert_eq!(f.engine.handle_reply(&first_reply), ReplyDisposition::Unknown);
        assert_eq!(f.engine.state(&second), Some(BatchJobState::Done));
    }

    #[test]
    fn test_non_batch_reply_is_unknown() {
        let f = fixture();
        let msg = f.ctx.bus.message(
            f.ctx.channels.repos(),
            f.ctx.channels.repos(),
            Payload::GetAllFilenames,
        );
        assert_eq!(f.engine.handle_reply(&msg), ReplyDisposition::Unknown);
    }
}
