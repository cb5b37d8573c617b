//! Per-replica proxies.
//!
//! One [`ReplicaClient`] exists per configured replica. The two implementations
//! share the same contract: validate arguments first, then build and send one
//! message, and on a delivery failure try to post an error reply to the
//! caller's reply channel before returning the error. Operations a replica kind
//! cannot serve are answered locally with a not-ok reply instead of an error.

use std::fmt;
use std::sync::Arc;

use arcgrid_bus::{
    BatchJobSpec, BusContext, Channel, ChannelRegistry, Checksum, FileFilter, FileRef, JobId,
    Message, MessageId, Payload, ReplicaId, ReplicaKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::FilterMatcher;
use crate::error::{ReplError, Result};

/// A configured replica and its fixed channel bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    id: ReplicaId,
    kind: ReplicaKind,
    all: Channel,
    any: Channel,
    monitor: Channel,
}

impl Replica {
    /// Bind a replica to its channels.
    pub fn new(id: ReplicaId, kind: ReplicaKind, channels: &ChannelRegistry) -> Self {
        Self {
            all: channels.all(kind, &id),
            any: channels.any(kind, &id),
            monitor: channels.monitor(&id),
            id,
            kind,
        }
    }

    /// Replica id.
    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Replica kind.
    pub fn kind(&self) -> ReplicaKind {
        self.kind
    }

    /// Broadcast channel to every instance.
    pub fn all(&self) -> &Channel {
        &self.all
    }

    /// Queue to any one instance.
    pub fn any(&self) -> &Channel {
        &self.any
    }

    /// Queue to the replica's monitor.
    pub fn monitor(&self) -> &Channel {
        &self.monitor
    }
}

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchJobState {
    /// Sent, nothing heard back.
    Submitted,
    /// At least one pillar has reported.
    Running,
    /// Termination requested; further results are discarded.
    Terminating,
    /// Finished and accepted.
    Done,
    /// Finished and rejected.
    Failed,
}

impl BatchJobState {
    /// True for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchJobState::Done | BatchJobState::Failed)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition(&self, next: BatchJobState) -> bool {
        use BatchJobState::*;
        matches!(
            (self, next),
            (Submitted, Running)
                | (Submitted, Terminating)
                | (Submitted, Done)
                | (Submitted, Failed)
                | (Running, Terminating)
                | (Running, Done)
                | (Running, Failed)
                | (Terminating, Done)
                | (Terminating, Failed)
        )
    }
}

impl fmt::Display for BatchJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchJobState::Submitted => "submitted",
            BatchJobState::Running => "running",
            BatchJobState::Terminating => "terminating",
            BatchJobState::Done => "done",
            BatchJobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Handle of a batch job sent to one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    /// Job id shared by every pillar running the job.
    pub job_id: JobId,
    /// Job body.
    pub spec: BatchJobSpec,
    /// File selection.
    pub filter: FileFilter,
    /// Replica the job was sent to.
    pub target: ReplicaId,
    /// Id of the `RunBatch` message.
    pub message_id: MessageId,
    /// Current state.
    pub state: BatchJobState,
}

impl BatchJob {
    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn transition(&mut self, next: BatchJobState) -> bool {
        if self.state.can_transition(next) {
            debug!(job = %self.job_id, from = %self.state, to = %next, "batch job state");
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Uniform operations on one replica, whatever its kind.
pub trait ReplicaClient: Send + Sync {
    /// The replica this client talks to.
    fn replica(&self) -> &Replica;

    /// The replica's kind.
    fn kind(&self) -> ReplicaKind {
        self.replica().kind()
    }

    /// Ask any one instance to store a file. `None` is rejected before sending.
    fn store(&self, file: Option<FileRef>, precomputed: Option<Checksum>) -> Result<Message>;

    /// Ask every instance for a record; the first responder wins downstream.
    fn retrieve(&self, file_id: &str, offset: u64) -> Result<Message>;

    /// Send a batch job to the replica's monitor.
    fn run_batch_job(
        &self,
        job_id: JobId,
        spec: BatchJobSpec,
        reply_channel: &Channel,
        filter: Option<FileFilter>,
    ) -> Result<BatchJob>;

    /// Broadcast a best-effort termination of a batch job.
    fn terminate_batch_job(&self, job_id: &JobId) -> Result<Message>;

    /// Ask the monitor to correct a divergent entry.
    fn correct(
        &self,
        filename: &str,
        expected: &Checksum,
        reported: &Checksum,
        replacement: Option<FileRef>,
    ) -> Result<Message>;

    /// Ask for the checksum of one file.
    fn get_checksum(&self, filename: &str) -> Result<Message>;

    /// Ask for every `filename,checksum` line.
    fn get_all_checksums(&self) -> Result<Message>;

    /// Ask for every filename.
    fn get_all_filenames(&self) -> Result<Message>;

    /// Forward an already built request to this replica under the same id
    /// and reply-to.
    ///
    /// The destination follows the payload: stores go to any one instance,
    /// retrievals and terminations to every instance, everything else to the
    /// monitor. A payload this kind cannot serve is answered locally with a
    /// not-ok reply. A delivery failure answers the original reply-to with an
    /// error before the error is returned.
    fn forward(&self, msg: Message) -> Result<Message>;
}

/// State shared by both client kinds.
struct ClientCore {
    replica: Replica,
    ctx: BusContext,
    reply_to: Channel,
}

impl ClientCore {
    fn message(&self, to: &Channel, payload: Payload) -> Message {
        self.ctx.bus.message(to.clone(), self.reply_to.clone(), payload)
    }

    /// Send, or on failure notify the reply channel and return the error.
    fn send_or_notify(&self, mut msg: Message) -> Result<Message> {
        match self.ctx.bus.send(&msg) {
            Ok(()) => Ok(msg),
            Err(e) => {
                warn!(replica = %self.replica.id, msg = %msg, error = %e, "send failed");
                self.ctx.bus.notify_failure(&mut msg, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Answer locally with an error reply for an operation this kind cannot serve.
    fn unsupported(&self, to: &Channel, payload: Payload) -> Result<Message> {
        let mut msg = self.message(to, payload);
        let err = ReplError::Unsupported {
            operation: msg.payload().kind_name(),
            kind: self.replica.kind,
            replica: self.replica.id.clone(),
        };
        debug!(msg = %msg, "{}", err);
        self.ctx.bus.notify_failure(&mut msg, &err.to_string());
        Ok(msg)
    }

    fn route(&self, payload: &Payload) -> &Channel {
        match payload {
            Payload::Store { .. } => &self.replica.any,
            Payload::Retrieve { .. } | Payload::TerminateBatch { .. } => &self.replica.all,
            _ => &self.replica.monitor,
        }
    }

    fn forward(&self, mut msg: Message, supported: bool) -> Result<Message> {
        if msg.is_replied() {
            return Err(ReplError::invalid("message", "already answered"));
        }
        match msg.payload() {
            Payload::RunBatch { job_id, filter, .. } => {
                require_job_id(job_id)?;
                FilterMatcher::new(filter)?;
            }
            Payload::Correct {
                replacement: None, ..
            } if self.replica.kind == ReplicaKind::BitArchive => {
                return Err(ReplError::invalid(
                    "replacement",
                    "a bit archive needs the replacement file",
                ));
            }
            _ => {}
        }
        if !supported {
            let err = ReplError::Unsupported {
                operation: msg.payload().kind_name(),
                kind: self.replica.kind,
                replica: self.replica.id.clone(),
            };
            debug!(msg = %msg, "{}", err);
            self.ctx.bus.notify_failure(&mut msg, &err.to_string());
            return Ok(msg);
        }
        let to = self.route(msg.payload()).clone();
        match self.ctx.bus.resend(&mut msg, to) {
            Ok(()) => {
                debug!(replica = %self.replica.id, msg = %msg, "forwarded");
                Ok(msg)
            }
            Err(e) => {
                warn!(replica = %self.replica.id, msg = %msg, error = %e, "forward failed");
                Err(e.into())
            }
        }
    }

    fn store(&self, file: Option<FileRef>, precomputed: Option<Checksum>) -> Result<Message> {
        let file = file.ok_or_else(|| ReplError::invalid("file", "no file given"))?;
        require_name("file.name", &file.name)?;
        if precomputed.as_ref().is_some_and(Checksum::is_empty) {
            return Err(ReplError::invalid("precomputed_checksum", "empty checksum"));
        }
        let msg = self.message(
            &self.replica.any,
            Payload::Store {
                file,
                precomputed_checksum: precomputed,
            },
        );
        self.send_or_notify(msg)
    }

    fn correct(
        &self,
        filename: &str,
        expected: &Checksum,
        reported: &Checksum,
        replacement: Option<FileRef>,
    ) -> Result<Message> {
        require_name("filename", filename)?;
        if expected.is_empty() {
            return Err(ReplError::invalid("expected_checksum", "empty checksum"));
        }
        if expected == reported {
            return Err(ReplError::invalid(
                "reported_checksum",
                "equals the expected checksum, nothing to correct",
            ));
        }
        if let Some(file) = &replacement {
            if file.name != filename {
                return Err(ReplError::invalid(
                    "replacement",
                    format!("names {} instead of {}", file.name, filename),
                ));
            }
        }
        let msg = self.message(
            &self.replica.monitor,
            Payload::Correct {
                filename: filename.to_string(),
                expected_checksum: expected.clone(),
                reported_checksum: reported.clone(),
                replacement,
            },
        );
        self.send_or_notify(msg)
    }

    fn get_checksum(&self, filename: &str) -> Result<Message> {
        require_name("filename", filename)?;
        let msg = self.message(
            &self.replica.monitor,
            Payload::GetChecksum {
                filename: filename.to_string(),
            },
        );
        self.send_or_notify(msg)
    }
}

fn require_name(name: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ReplError::invalid(name, "must not be empty"));
    }
    if value.contains(',') || value.contains('\n') {
        return Err(ReplError::invalid(name, "must not contain ',' or a newline"));
    }
    Ok(())
}

fn require_job_id(job_id: &JobId) -> Result<()> {
    if job_id.as_str().trim().is_empty() {
        return Err(ReplError::invalid("job_id", "must not be empty"));
    }
    Ok(())
}

/// Client for a replica holding full file payloads.
pub struct BitArchiveClient {
    core: ClientCore,
}

impl BitArchiveClient {
    /// Create a client replying to `reply_to`.
    pub fn new(replica: Replica, ctx: BusContext, reply_to: Channel) -> Self {
        Self {
            core: ClientCore {
                replica,
                ctx,
                reply_to,
            },
        }
    }
}

impl ReplicaClient for BitArchiveClient {
    fn replica(&self) -> &Replica {
        &self.core.replica
    }

    fn store(&self, file: Option<FileRef>, precomputed: Option<Checksum>) -> Result<Message> {
        self.core.store(file, precomputed)
    }

    fn retrieve(&self, file_id: &str, offset: u64) -> Result<Message> {
        require_name("file_id", file_id)?;
        let msg = self.core.message(
            &self.core.replica.all,
            Payload::Retrieve {
                file_id: file_id.to_string(),
                offset,
            },
        );
        self.core.send_or_notify(msg)
    }

    fn run_batch_job(
        &self,
        job_id: JobId,
        spec: BatchJobSpec,
        reply_channel: &Channel,
        filter: Option<FileFilter>,
    ) -> Result<BatchJob> {
        require_job_id(&job_id)?;
        let filter = filter.unwrap_or_default();
        FilterMatcher::new(&filter)?;
        let msg = self.core.ctx.bus.message(
            self.core.replica.monitor.clone(),
            reply_channel.clone(),
            Payload::RunBatch {
                job_id: job_id.clone(),
                spec: spec.clone(),
                filter: filter.clone(),
                reply_channel: reply_channel.clone(),
            },
        );
        let msg = self.core.send_or_notify(msg)?;
        Ok(BatchJob {
            job_id,
            spec,
            filter,
            target: self.core.replica.id.clone(),
            message_id: msg.id().clone(),
            state: BatchJobState::Submitted,
        })
    }

    fn terminate_batch_job(&self, job_id: &JobId) -> Result<Message> {
        require_job_id(job_id)?;
        let msg = self.core.message(
            &self.core.replica.all,
            Payload::TerminateBatch {
                job_id: job_id.clone(),
            },
        );
        self.core.send_or_notify(msg)
    }

    fn correct(
        &self,
        filename: &str,
        expected: &Checksum,
        reported: &Checksum,
        replacement: Option<FileRef>,
    ) -> Result<Message> {
        if replacement.is_none() {
            return Err(ReplError::invalid(
                "replacement",
                "a bit archive needs the replacement file",
            ));
        }
        self.core.correct(filename, expected, reported, replacement)
    }

    fn get_checksum(&self, filename: &str) -> Result<Message> {
        self.core.get_checksum(filename)
    }

    fn get_all_checksums(&self) -> Result<Message> {
        self.core
            .unsupported(&self.core.replica.monitor, Payload::GetAllChecksums)
    }

    fn get_all_filenames(&self) -> Result<Message> {
        self.core
            .unsupported(&self.core.replica.monitor, Payload::GetAllFilenames)
    }

    fn forward(&self, msg: Message) -> Result<Message> {
        let supported = !matches!(
            msg.payload(),
            Payload::GetAllChecksums | Payload::GetAllFilenames
        );
        self.core.forward(msg, supported)
    }
}

/// Client for a replica holding checksums only.
pub struct ChecksumArchiveClient {
    core: ClientCore,
}

impl ChecksumArchiveClient {
    /// Create a client replying to `reply_to`.
    pub fn new(replica: Replica, ctx: BusContext, reply_to: Channel) -> Self {
        Self {
            core: ClientCore {
                replica,
                ctx,
                reply_to,
            },
        }
    }
}

impl ReplicaClient for ChecksumArchiveClient {
    fn replica(&self) -> &Replica {
        &self.core.replica
    }

    fn store(&self, file: Option<FileRef>, precomputed: Option<Checksum>) -> Result<Message> {
        self.core.store(file, precomputed)
    }

    fn retrieve(&self, file_id: &str, offset: u64) -> Result<Message> {
        require_name("file_id", file_id)?;
        self.core.unsupported(
            &self.core.replica.all,
            Payload::Retrieve {
                file_id: file_id.to_string(),
                offset,
            },
        )
    }

    fn run_batch_job(
        &self,
        job_id: JobId,
        spec: BatchJobSpec,
        reply_channel: &Channel,
        filter: Option<FileFilter>,
    ) -> Result<BatchJob> {
        require_job_id(&job_id)?;
        let filter = filter.unwrap_or_default();
        let mut msg = self.core.ctx.bus.message(
            self.core.replica.monitor.clone(),
            reply_channel.clone(),
            Payload::RunBatch {
                job_id: job_id.clone(),
                spec: spec.clone(),
                filter: filter.clone(),
                reply_channel: reply_channel.clone(),
            },
        );
        let err = ReplError::Unsupported {
            operation: "RunBatch",
            kind: self.core.replica.kind,
            replica: self.core.replica.id.clone(),
        };
        self.core.ctx.bus.notify_failure(&mut msg, &err.to_string());
        Ok(BatchJob {
            job_id,
            spec,
            filter,
            target: self.core.replica.id.clone(),
            message_id: msg.id().clone(),
            state: BatchJobState::Failed,
        })
    }

    fn terminate_batch_job(&self, job_id: &JobId) -> Result<Message> {
        require_job_id(job_id)?;
        self.core.unsupported(
            &self.core.replica.all,
            Payload::TerminateBatch {
                job_id: job_id.clone(),
            },
        )
    }

    fn correct(
        &self,
        filename: &str,
        expected: &Checksum,
        reported: &Checksum,
        replacement: Option<FileRef>,
    ) -> Result<Message> {
        self.core.correct(filename, expected, reported, replacement)
    }

    fn get_checksum(&self, filename: &str) -> Result<Message> {
        self.core.get_checksum(filename)
    }

    fn get_all_checksums(&self) -> Result<Message> {
        let msg = self
            .core
            .message(&self.core.replica.monitor, Payload::GetAllChecksums);
        self.core.send_or_notify(msg)
    }

    fn get_all_filenames(&self) -> Result<Message> {
        let msg = self
            .core
            .message(&self.core.replica.monitor, Payload::GetAllFilenames);
        self.core.send_or_notify(msg)
    }

    fn forward(&self, msg: Message) -> Result<Message> {
        let supported = !matches!(
            msg.payload(),
            Payload::Retrieve { .. } | Payload::RunBatch { .. } | Payload::TerminateBatch { .. }
        );
        self.core.forward(msg, supported)
    }
}

/// Build the client matching a replica's kind.
pub fn client_for(replica: Replica, ctx: BusContext, reply_to: Channel) -> Arc<dyn ReplicaClient> {
    match replica.kind() {
        ReplicaKind::BitArchive => Arc::new(BitArchiveClient::new(replica, ctx, reply_to)),
        ReplicaKind::ChecksumArchive => {
            Arc::new(ChecksumArchiveClient::new(replica, ctx, reply_to))
        }
    }
}
