//! The archive repository's view of the grid.
//!
//! [`GridCoordinator`] wires one client per configured replica, listens on the
//! `REPOS` channel through a [`ReplyRouter`] and drives the multi-pillar
//! operations: quorum stores, first-reply retrieval, the consistency cycle,
//! reconciliation sweeps, batch jobs and forwarding of generic requests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arcgrid_bus::{
    BatchJobSpec, BusContext, Channel, Checksum, FileFilter, FileRef, JobId, Message, MessageId,
    MessageListener, Payload, Reply, ReplicaId, ReplicaKind, Transport,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{BatchJobEngine, BatchOutcome, BatchReplyListener, BatchTarget};
use crate::checksum::{digest, read_names, read_records, ChecksumRecord};
use crate::client::{client_for, Replica, ReplicaClient};
use crate::config::GridConfig;
use crate::consistency::{
    sweep, sweep_filenames, Authority, ConsistencyChecker, ConsistencyFailure, Divergence,
    FileState, NameFinding, SweepFinding,
};
use crate::correlation::ReplyRouter;
use crate::error::{ReplError, Result};
use crate::quorum::{FailureCause, OperationOutcome, Recorded, Verdict};

/// Verdict of one multi-pillar operation, with per-pillar detail for audit.
#[derive(Debug, Clone)]
pub struct OperationReport {
    /// Payload kind of the operation.
    pub operation: &'static str,
    /// Collection the pillars belong to.
    pub collection: String,
    /// The single verdict for the caller.
    pub verdict: Verdict,
    /// Pillars that succeeded.
    pub succeeded: BTreeSet<ReplicaId>,
    /// Pillars that failed, and why.
    pub failed: BTreeMap<ReplicaId, FailureCause>,
    /// Checksum of the stored content.
    pub checksum: Option<Checksum>,
}

impl OperationReport {
    fn new(operation: &'static str, collection: &str, outcome: &OperationOutcome) -> Self {
        Self {
            operation,
            collection: collection.to_string(),
            verdict: outcome.final_verdict(),
            succeeded: outcome.succeeded().clone(),
            failed: outcome.failed().clone(),
            checksum: None,
        }
    }
}

/// Result of one consistency cycle for a file.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// The file.
    pub filename: String,
    /// Quorum verdict over the checksum replies. When it rejects, nothing
    /// was compared or corrected.
    pub verdict: Verdict,
    /// Pillars that gave no checksum, and why.
    pub pillar_failures: BTreeMap<ReplicaId, FailureCause>,
    /// Where the file ended up.
    pub state: FileState,
    /// The authoritative checksum chosen.
    pub expected: Option<Checksum>,
    /// Replicas still divergent after the cycle.
    pub divergent: Vec<Divergence>,
    /// Corrections that were given up on.
    pub failures: Vec<ConsistencyFailure>,
}

/// Result of a reconciliation sweep over one replica.
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// The replica swept.
    pub replica: ReplicaId,
    /// Every discrepancy, in filename order.
    pub findings: Vec<SweepFinding>,
    /// Mismatches marked divergent for correction.
    pub marked: usize,
}

impl SweepReport {
    /// True when the replica matched the authoritative listing.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Result of a filename sweep over one replica.
#[derive(Debug, Clone)]
pub struct NameSweepReport {
    /// The replica swept.
    pub replica: ReplicaId,
    /// Every missing or unexpected name, in filename order.
    pub findings: Vec<NameFinding>,
}

impl NameSweepReport {
    /// True when the replica holds exactly the authoritative names.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Coordinates requests to every configured replica.
pub struct GridCoordinator {
    config: GridConfig,
    ctx: BusContext,
    clients: BTreeMap<ReplicaId, Arc<dyn ReplicaClient>>,
    router: ReplyRouter,
    listener: Arc<dyn MessageListener>,
    engine: Arc<BatchJobEngine>,
    checker: ConsistencyChecker,
}

impl GridCoordinator {
    /// Build the coordinator and start listening on `REPOS`.
    pub fn new(config: GridConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let ctx = BusContext::new(&config.environment, transport);
        let reply = ctx.channels.repos();

        let clients: BTreeMap<ReplicaId, Arc<dyn ReplicaClient>> = config
            .replicas
            .iter()
            .map(|r| {
                let replica = Replica::new(r.id.clone(), r.kind, &ctx.channels);
                (r.id.clone(), client_for(replica, ctx.clone(), reply.clone()))
            })
            .collect();

        let engine = Arc::new(BatchJobEngine::new(
            ctx.clone(),
            clients.values().cloned(),
            reply.clone(),
        ));
        let router = ReplyRouter::new();
        router.set_fallback(Arc::new(BatchReplyListener::new(Arc::clone(&engine))));
        let listener: Arc<dyn MessageListener> = Arc::new(router.clone());
        ctx.bus.set_listener(&reply, Arc::clone(&listener))?;

        let checker =
            ConsistencyChecker::new(clients.values().cloned(), config.max_correction_attempts);
        info!(
            environment = %config.environment,
            replicas = clients.len(),
            collections = config.collections.len(),
            "grid coordinator started"
        );
        Ok(Self {
            config,
            ctx,
            clients,
            router,
            listener,
            engine,
            checker,
        })
    }

    /// Stop listening for replies.
    pub fn close(&self) -> Result<()> {
        self.ctx
            .bus
            .remove_listener(&self.ctx.channels.repos(), &self.listener)?;
        Ok(())
    }

    /// The configuration in use.
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// The bus context shared with the clients.
    pub fn context(&self) -> &BusContext {
        &self.ctx
    }

    /// The channel replies arrive on.
    pub fn reply_channel(&self) -> Channel {
        self.ctx.channels.repos()
    }

    /// Client for one replica.
    pub fn client(&self, replica: &ReplicaId) -> Result<&Arc<dyn ReplicaClient>> {
        self.clients
            .get(replica)
            .ok_or_else(|| ReplError::UnknownReplica {
                replica: replica.clone(),
            })
    }

    /// The batch job engine.
    pub fn engine(&self) -> &Arc<BatchJobEngine> {
        &self.engine
    }

    /// The consistency checker.
    pub fn checker(&self) -> &ConsistencyChecker {
        &self.checker
    }

    /// The reply router.
    pub fn router(&self) -> &ReplyRouter {
        &self.router
    }

    /// Store a file on every pillar of a collection.
    ///
    /// Validation errors are returned as `Err`. Once anything is sent the
    /// result is an [`OperationReport`] whose verdict says whether the grid
    /// accepted the file.
    pub async fn store(
        &self,
        file: FileRef,
        collection: &str,
        timeout: Duration,
    ) -> Result<OperationReport> {
        if file.name.trim().is_empty() {
            return Err(ReplError::invalid("file", "name must not be empty"));
        }
        let policy = self.config.policy(collection)?;
        let pillars = policy
            .pillar_ids()
            .iter()
            .map(|id| self.client(id).map(|c| (id.clone(), Arc::clone(c))))
            .collect::<Result<Vec<_>>>()?;

        let checksum = digest(&file.content);
        let mut outcome = OperationOutcome::new(policy);
        let mut sent: HashMap<MessageId, ReplicaId> = HashMap::new();
        for (pillar, client) in pillars {
            match client.store(Some(file.clone()), Some(checksum.clone())) {
                Ok(msg) => {
                    sent.insert(msg.id().clone(), pillar);
                }
                Err(e @ ReplError::ArgumentInvalid { .. }) => return Err(e),
                Err(e) => {
                    outcome.record_failure(&pillar, FailureCause::Unreachable(e.to_string()))?;
                }
            }
        }

        self.tally(&mut outcome, &sent, timeout, |_, msg| {
            Ok(if msg.is_ok() {
                None
            } else {
                Some(msg.error_text().unwrap_or("unspecified").to_string())
            })
        })
        .await?;
        let mut report = OperationReport::new("Store", collection, &outcome);
        report.checksum = Some(checksum);
        info!(
            file = %file.name,
            collection,
            verdict = ?report.verdict,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "store finished"
        );
        Ok(report)
    }

    /// Collect replies into `outcome` until it is complete or the wait runs
    /// out, then expire the silent pillars. `judge` returns `None` for a
    /// success and the failure text otherwise.
    async fn tally<F>(
        &self,
        outcome: &mut OperationOutcome,
        sent: &HashMap<MessageId, ReplicaId>,
        timeout: Duration,
        mut judge: F,
    ) -> Result<()>
    where
        F: FnMut(&ReplicaId, &Message) -> Result<Option<String>>,
    {
        let mut stream = self.router.register_all(sent.keys().cloned());
        let deadline = Instant::now() + timeout;
        while !outcome.is_complete() {
            let msg = match stream.next_before(deadline, timeout).await {
                Ok(msg) => msg,
                Err(_) => break,
            };
            let Some(pillar) = sent.get(msg.id()) else {
                continue;
            };
            let recorded = match judge(pillar, &msg)? {
                None => outcome.record_success(pillar)?,
                Some(reason) => outcome.record_failure(pillar, FailureCause::Reported(reason))?,
            };
            if recorded == Recorded::Duplicate {
                debug!(pillar = %pillar, "duplicate reply");
            }
        }
        let silent = outcome.expire();
        if !silent.is_empty() {
            warn!(silent = ?silent, "pillars did not reply in time");
        }
        Ok(())
    }

    /// Read a file from a bit archive. The request is broadcast to every
    /// instance of the replica; the first successful reply wins.
    pub async fn retrieve(
        &self,
        replica: &ReplicaId,
        file_id: &str,
        offset: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let client = self.client(replica)?;
        let msg = client.retrieve(file_id, offset)?;
        if let Some(err) = refused_locally(&self.router, client.as_ref(), &msg) {
            return Err(err);
        }
        let mut stream = self.router.register(msg.id().clone());
        let reply = stream.first_ok(timeout).await?;
        match reply.reply() {
            Some(Reply::Record { data, .. }) => Ok(data.clone()),
            _ => Err(ReplError::PillarFailure {
                replica: replica.clone(),
                reason: format!("unexpected reply to retrieve: {}", reply),
            }),
        }
    }

    /// Run the full consistency cycle for one file over a collection's pillars.
    ///
    /// The checksum replies are tallied against the collection's quorum
    /// policy; a pillar that stays silent counts as a failure. Only an
    /// accepted tally is compared and corrected. Divergent checksum archives
    /// are corrected with the expected checksum. Divergent bit archives need
    /// the good content: `replacement` when given, otherwise it is fetched
    /// from a bit archive that reported the expected checksum.
    ///
    /// The investigation is dropped once the report is built; operator
    /// failures stay available from the checker.
    pub async fn verify_file(
        &self,
        filename: &str,
        collection: &str,
        authority: Authority,
        replacement: Option<FileRef>,
        timeout: Duration,
    ) -> Result<VerifyReport> {
        let result = self
            .investigate(filename, collection, authority, replacement, timeout)
            .await;
        self.checker.forget(filename);
        result
    }

    async fn investigate(
        &self,
        filename: &str,
        collection: &str,
        authority: Authority,
        replacement: Option<FileRef>,
        timeout: Duration,
    ) -> Result<VerifyReport> {
        let policy = self.config.policy(collection)?;
        let replicas: Vec<ReplicaId> = policy.pillar_ids().iter().cloned().collect();

        let sent = self.checker.request(filename, &replicas)?;
        let by_id: HashMap<MessageId, ReplicaId> = sent
            .iter()
            .map(|(replica, msg)| (msg.id().clone(), replica.clone()))
            .collect();
        let mut outcome = OperationOutcome::new(policy);
        for replica in &replicas {
            if !by_id.values().any(|r| r == replica) {
                let cause = FailureCause::Unreachable("checksum request not sent".to_string());
                outcome.record_failure(replica, cause)?;
            }
        }
        self.tally(&mut outcome, &by_id, timeout, |replica, msg| {
            Ok(if self.checker.record_reply(replica, msg)? {
                None
            } else {
                Some(msg.error_text().unwrap_or("reply carries no checksum").to_string())
            })
        })
        .await?;

        let verdict = outcome.final_verdict();
        if verdict.is_reject() {
            warn!(file = filename, collection, verdict = ?verdict, "checksum quorum not reached");
            return Ok(self.verify_report(filename, verdict, outcome.failed().clone()));
        }

        let state = self.checker.compare(filename, &authority)?;
        if state == FileState::Diverged {
            let replacement = match replacement {
                Some(file) => Some(file),
                None => self.find_replacement(filename, &replicas, timeout).await,
            };
            self.drive_corrections(filename, replacement, timeout).await?;
        }
        Ok(self.verify_report(filename, verdict, outcome.failed().clone()))
    }

    async fn find_replacement(
        &self,
        filename: &str,
        replicas: &[ReplicaId],
        timeout: Duration,
    ) -> Option<FileRef> {
        let expected = self.checker.expected(filename)?;
        let divergent: BTreeSet<ReplicaId> = self
            .checker
            .divergence_set()
            .into_iter()
            .filter(|d| d.filename == filename)
            .map(|d| d.replica)
            .collect();
        if !divergent
            .iter()
            .any(|r| self.clients.get(r).map(|c| c.kind()) == Some(ReplicaKind::BitArchive))
        {
            return None;
        }

        for replica in replicas.iter().filter(|r| !divergent.contains(*r)) {
            if self.clients.get(replica).map(|c| c.kind()) != Some(ReplicaKind::BitArchive) {
                continue;
            }
            match self.retrieve(replica, filename, 0, timeout).await {
                Ok(content) if digest(&content) == expected => {
                    debug!(file = filename, source = %replica, "replacement fetched");
                    return Some(FileRef::new(filename, content));
                }
                Ok(_) => warn!(file = filename, source = %replica, "replacement does not match"),
                Err(e) => warn!(file = filename, source = %replica, error = %e, "replacement not fetched"),
            }
        }
        None
    }

    /// Send corrections for a diverged file until every divergent replica is
    /// corrected or has exhausted its attempts. A settled investigation is
    /// dropped afterwards.
    pub async fn correct(
        &self,
        filename: &str,
        replacement: Option<FileRef>,
        timeout: Duration,
    ) -> Result<FileState> {
        let state = self.drive_corrections(filename, replacement, timeout).await?;
        if matches!(state, FileState::Corrected | FileState::CorrectionFailed) {
            self.checker.forget(filename);
        }
        Ok(state)
    }

    async fn drive_corrections(
        &self,
        filename: &str,
        replacement: Option<FileRef>,
        timeout: Duration,
    ) -> Result<FileState> {
        while self.checker.has_pending(filename) {
            let sent = self.checker.send_corrections(filename, replacement.clone())?;
            if sent.is_empty() {
                continue;
            }
            let mut stream = self.router.register_all(sent.iter().map(|m| m.id().clone()));
            let replies = stream.collect(sent.len(), timeout).await;
            drop(stream);
            for msg in &replies {
                self.checker.handle_correction_reply(msg);
            }
            if replies.len() < sent.len() {
                self.checker.expire_corrections(filename);
            }
        }
        self.checker
            .state(filename)
            .ok_or_else(|| ReplError::invalid("filename", format!("{} is not under investigation", filename)))
    }

    fn verify_report(
        &self,
        filename: &str,
        verdict: Verdict,
        pillar_failures: BTreeMap<ReplicaId, FailureCause>,
    ) -> VerifyReport {
        VerifyReport {
            filename: filename.to_string(),
            verdict,
            pillar_failures,
            state: self.checker.state(filename).unwrap_or(FileState::Requested),
            expected: self.checker.expected(filename),
            divergent: self
                .checker
                .divergence_set()
                .into_iter()
                .filter(|d| d.filename == filename)
                .collect(),
            failures: self
                .checker
                .failures()
                .into_iter()
                .filter(|f| f.filename == filename)
                .collect(),
        }
    }

    /// Compare a replica's full listing with the authoritative records,
    /// which must be sorted by filename. Mismatches are marked divergent so
    /// that [`correct`](Self::correct) can repair them.
    ///
    /// Checksum archives are asked for their checksum listing. Bit archives
    /// run a checksum batch job, whose output must come sorted. Both sides
    /// are compared line by line as they are parsed.
    pub async fn sweep_replica<I>(
        &self,
        replica: &ReplicaId,
        authoritative: I,
        timeout: Duration,
    ) -> Result<SweepReport>
    where
        I: IntoIterator<Item = Result<ChecksumRecord>>,
    {
        let client = Arc::clone(self.client(replica)?);
        let listing = match client.kind() {
            ReplicaKind::ChecksumArchive => self.listing(client.as_ref(), false, timeout).await?,
            ReplicaKind::BitArchive => {
                self.batch_output(replica, BatchJobSpec::Checksum, timeout)
                    .await?
            }
        };

        let mut report = SweepReport {
            replica: replica.clone(),
            findings: Vec::new(),
            marked: 0,
        };
        for finding in sweep(authoritative, read_records(listing.as_slice())) {
            let finding = finding?;
            if let SweepFinding::Mismatch {
                filename,
                expected,
                reported,
            } = &finding
            {
                self.checker
                    .mark_divergent(filename, replica, reported.clone(), expected.clone())?;
                report.marked += 1;
            }
            report.findings.push(finding);
        }
        info!(
            replica = %replica,
            findings = report.findings.len(),
            marked = report.marked,
            "sweep finished"
        );
        Ok(report)
    }

    /// Compare the names a replica holds with the authoritative names,
    /// which must be sorted. Missing and unexpected files are reported;
    /// nothing is marked for correction.
    ///
    /// Checksum archives are asked for their filename listing. Bit archives
    /// run a file listing batch job, whose output must come sorted.
    pub async fn sweep_filenames_replica<I>(
        &self,
        replica: &ReplicaId,
        authoritative: I,
        timeout: Duration,
    ) -> Result<NameSweepReport>
    where
        I: IntoIterator<Item = Result<String>>,
    {
        let client = Arc::clone(self.client(replica)?);
        let listing = match client.kind() {
            ReplicaKind::ChecksumArchive => self.listing(client.as_ref(), true, timeout).await?,
            ReplicaKind::BitArchive => {
                self.batch_output(replica, BatchJobSpec::ListFiles, timeout)
                    .await?
            }
        };
        let findings = sweep_filenames(authoritative, read_names(listing.as_slice()))
            .collect::<Result<Vec<_>>>()?;
        info!(replica = %replica, findings = findings.len(), "filename sweep finished");
        Ok(NameSweepReport {
            replica: replica.clone(),
            findings,
        })
    }

    /// Fetch a checksum archive's checksum or filename listing.
    async fn listing(
        &self,
        client: &dyn ReplicaClient,
        names_only: bool,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let msg = if names_only {
            client.get_all_filenames()?
        } else {
            client.get_all_checksums()?
        };
        if let Some(err) = refused_locally(&self.router, client, &msg) {
            return Err(err);
        }
        let mut stream = self.router.register(msg.id().clone());
        let reply = stream.next(timeout).await?;
        let replica = client.replica().id().clone();
        if !reply.is_ok() {
            return Err(pillar_failure(replica, &reply));
        }
        match (names_only, reply.reply()) {
            (false, Some(Reply::ChecksumListing { lines, .. }))
            | (true, Some(Reply::FilenameListing { lines, .. })) => Ok(lines.clone().into_bytes()),
            _ => Err(ReplError::PillarFailure {
                replica,
                reason: "reply carries no listing".to_string(),
            }),
        }
    }

    /// Run a batch job on one bit archive and return its raw output.
    async fn batch_output(
        &self,
        replica: &ReplicaId,
        spec: BatchJobSpec,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let job_id = self.engine.submit(
            spec,
            FileFilter::All,
            BatchTarget::Replica(replica.clone()),
            0,
        )?;
        let outcome = self.engine.await_outcome(&job_id, timeout).await?;
        if !outcome.verdict.is_accept() {
            let reason = outcome
                .pillar_failures
                .get(replica)
                .map(|c| format!("{:?}", c))
                .unwrap_or_else(|| format!("batch job {} ended {}", job_id, outcome.state));
            return Err(ReplError::PillarFailure {
                replica: replica.clone(),
                reason,
            });
        }
        Ok(outcome.output)
    }

    /// Start a batch job. Use [`await_batch`](Self::await_batch) for the result.
    pub fn run_batch(
        &self,
        spec: BatchJobSpec,
        filter: FileFilter,
        target: BatchTarget,
    ) -> Result<JobId> {
        self.engine
            .submit(spec, filter, target, self.config.batch_max_failures)
    }

    /// Wait for a batch job to finish.
    pub async fn await_batch(&self, job_id: &JobId, timeout: Duration) -> Result<BatchOutcome> {
        self.engine.await_outcome(job_id, timeout).await
    }

    /// Ask for a batch job to stop. Finished jobs are left alone.
    pub fn terminate_batch(&self, job_id: &JobId) -> Result<()> {
        self.engine.terminate(job_id)
    }

    /// Forward a request addressed to the grid to the replica chosen to
    /// handle it. The message keeps its id and reply-to, so the replica
    /// answers the original caller.
    pub fn forward(&self, replica: &ReplicaId, msg: Message) -> Result<Message> {
        self.client(replica)?.forward(msg)
    }

    /// Forward a generic batch request to the monitor of the first bit
    /// archive of a collection. Returns the replica picked.
    pub fn forward_batch(&self, collection: &str, msg: Message) -> Result<ReplicaId> {
        if !matches!(msg.payload(), Payload::RunBatch { .. }) {
            return Err(ReplError::invalid(
                "message",
                format!("{} is not a batch job", msg.payload().kind_name()),
            ));
        }
        let policy = self.config.policy(collection)?;
        let replica = policy
            .pillar_ids()
            .iter()
            .find(|id| self.clients.get(*id).map(|c| c.kind()) == Some(ReplicaKind::BitArchive))
            .cloned()
            .ok_or_else(|| {
                ReplError::config(format!("collection {} has no bit archive", collection))
            })?;
        debug!(collection, replica = %replica, msg = %msg, "batch job forwarded");
        self.forward(&replica, msg)?;
        Ok(replica)
    }
}

/// The error for a request the client answered itself because the replica
/// kind cannot serve it. The local reply is claimed from the router.
fn refused_locally(
    router: &ReplyRouter,
    client: &dyn ReplicaClient,
    msg: &Message,
) -> Option<ReplError> {
    if msg.is_replied() && !msg.is_ok() {
        drop(router.register(msg.id().clone()));
        return Some(ReplError::Unsupported {
            operation: msg.payload().kind_name(),
            kind: client.kind(),
            replica: client.replica().id().clone(),
        });
    }
    None
}

fn pillar_failure(replica: ReplicaId, reply: &Message) -> ReplError {
    ReplError::PillarFailure {
        replica,
        reason: reply.error_text().unwrap_or("unspecified").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionConfig, ReplicaConfig};
    use arcgrid_bus::RecordingTransport;

    fn config() -> GridConfig {
        GridConfig {
            replicas: vec![
                ReplicaConfig {
                    id: ReplicaId::new("kb"),
                    kind: ReplicaKind::BitArchive,
                    name: None,
                },
                ReplicaConfig {
                    id: ReplicaId::new("cs"),
                    kind: ReplicaKind::ChecksumArchive,
                    name: None,
                },
            ],
            collections: vec![CollectionConfig {
                id: "web".into(),
                pillar_ids: vec![ReplicaId::new("kb"), ReplicaId::new("cs")],
                max_failures: 0,
            }],
            ..GridConfig::default()
        }
    }

    #[tokio::test]
    async fn test_store_with_empty_name_sends_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let err = grid
            .store(FileRef::new("", b"x".to_vec()), "web", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::ArgumentInvalid { .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_store_unknown_collection_is_config_error() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let err = grid
            .store(FileRef::new("a", b"x".to_vec()), "nope", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Config { .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_without_replies_is_rejected() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let report = grid
            .store(FileRef::new("a", b"x".to_vec()), "web", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(report.verdict.is_reject());
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .values()
            .all(|c| *c == FailureCause::NoResponse));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let mut cfg = config();
        cfg.reply_timeout_ms = 0;
        let transport = Arc::new(RecordingTransport::new());
        assert!(GridCoordinator::new(cfg, transport).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_without_replies_changes_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let report = grid
            .verify_file(
                "a",
                "web",
                Authority::Reference(digest(b"x")),
                None,
                Duration::from_millis(50),
            )
            .await
            .unwrap();

        assert!(report.verdict.is_reject());
        assert_eq!(report.state, FileState::Requested);
        assert!(report.divergent.is_empty());
        assert_eq!(report.pillar_failures.len(), 2);
        assert!(report
            .pillar_failures
            .values()
            .all(|c| *c == FailureCause::NoResponse));
        // Only the two checksum requests went out; no corrections.
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(grid.checker().tracked(), 0);
    }

    #[tokio::test]
    async fn test_retrieve_from_checksum_archive_fails_at_once() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let err = grid
            .retrieve(&ReplicaId::new("cs"), "a", 0, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReplError::Unsupported {
                operation: "Retrieve",
                ..
            }
        ));
        assert!(transport
            .sent()
            .iter()
            .all(|m| m.to() == &grid.reply_channel()));
        assert_eq!(grid.router().pending(), 0);
    }

    #[tokio::test]
    async fn test_unsorted_batch_listing_is_refused() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let kb = ReplicaId::new("kb");
        let monitor = grid.context().channels.monitor(&kb);
        let authoritative: Vec<Result<ChecksumRecord>> = vec![
            Ok(ChecksumRecord::new("a", digest(b"a"))),
            Ok(ChecksumRecord::new("b", digest(b"b"))),
        ];

        let answer = async {
            let mut msg = loop {
                if let Some(msg) = transport.sent_to(&monitor).pop() {
                    break msg;
                }
                tokio::task::yield_now().await;
            };
            let job_id = match msg.payload() {
                Payload::RunBatch { job_id, .. } => job_id.clone(),
                other => panic!("unexpected payload {:?}", other),
            };
            let output = format!("b,{}\na,{}\n", digest(b"b"), digest(b"a"));
            msg.set_reply(Reply::Batch(arcgrid_bus::BatchReport {
                job_id,
                replica: kb.clone(),
                files_processed: 2,
                failures: Vec::new(),
                output: output.into_bytes(),
            }))
            .unwrap();
            grid.engine().handle_reply(&msg);
        };
        let (swept, ()) = tokio::join!(
            grid.sweep_replica(&kb, authoritative, Duration::from_secs(5)),
            answer
        );

        assert!(matches!(swept.unwrap_err(), ReplError::Listing { .. }));
    }

    #[tokio::test]
    async fn test_forward_batch_goes_to_first_bit_archive() {
        let transport = Arc::new(RecordingTransport::new());
        let grid = GridCoordinator::new(config(), transport.clone()).unwrap();
        let ctx = grid.context().clone();
        let caller = ctx.channels.reply_to("auditor");
        let msg = ctx.bus.message(
            ctx.channels.repos(),
            caller.clone(),
            Payload::RunBatch {
                job_id: JobId::new("job-1"),
                spec: BatchJobSpec::ListFiles,
                filter: FileFilter::All,
                reply_channel: caller.clone(),
            },
        );
        let id = msg.id().clone();

        let picked = grid.forward_batch("web", msg).unwrap();
        assert_eq!(picked, ReplicaId::new("kb"));
        let sent = transport.sent_to(&ctx.channels.monitor(&picked));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), &id);
        assert_eq!(sent[0].reply_to(), &caller);

        let not_batch = ctx.bus.message(
            ctx.channels.repos(),
            caller,
            Payload::GetChecksum {
                filename: "a".to_string(),
            },
        );
        let err = grid.forward_batch("web", not_batch).unwrap_err();
        assert!(matches!(err, ReplError::ArgumentInvalid { name: "message", .. }));
    }

    #[tokio::test]
    async fn test_unknown_replica() {
        let grid = GridCoordinator::new(config(), Arc::new(RecordingTransport::new())).unwrap();
        let err = grid
            .retrieve(&ReplicaId::new("zz"), "a", 0, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::UnknownReplica { .. }));
    }
}
