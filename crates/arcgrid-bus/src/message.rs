//! The request/reply envelope exchanged between the repository and the replicas.
//!
//! Every message carries a process-unique id used to correlate replies, a
//! destination, a reply-to channel, a success flag with optional error text, a
//! closed request payload and, once answered, a closed reply payload. The reply
//! side (`ok`, `error_text`, `reply`) may be written exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::{Channel, ReplicaId};
use crate::error::{BusError, Result};

/// Correlation id of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints message ids as `<process uuid>-<counter>`.
///
/// The process identity is a fresh v4 UUID per generator, so ids stay unique
/// across restarts of the sender and across processes sharing a broker.
#[derive(Debug)]
pub struct MessageIdGenerator {
    process: String,
    next: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator with a random process identity.
    pub fn new() -> Self {
        Self::with_process(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a generator with a fixed process identity.
    pub fn with_process(process: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Process identity prefixed to every id.
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Mint the next id. Never returns the same id twice.
    pub fn next_id(&self) -> MessageId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        MessageId(format!("{}-{}", self.process, seq))
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A content checksum in lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Wrap a checksum string, normalising to lower case.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_ascii_lowercase())
    }

    /// The hex text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty checksum.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file handed to a replica by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Archive filename.
    pub name: String,
    /// File content.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl FileRef {
    /// Create a file reference.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Selects which archived files a batch job runs over.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileFilter {
    /// Every file.
    #[default]
    All,
    /// One named file.
    Exact(String),
    /// Files whose name starts with the prefix.
    Prefix(String),
    /// Files whose name matches the regular expression.
    Pattern(String),
}

/// Identifier of a batch job, shared by every pillar running it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap a job id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<MessageId> for JobId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The body of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchJobSpec {
    /// Emit `filename,checksum` for every selected file.
    Checksum,
    /// Emit the name of every selected file.
    ListFiles,
    /// A job body understood by the replica application.
    Custom {
        /// Job name.
        name: String,
        /// Job arguments.
        args: Vec<String>,
    },
}

impl BatchJobSpec {
    /// Short name for logs.
    pub fn name(&self) -> &str {
        match self {
            BatchJobSpec::Checksum => "checksum",
            BatchJobSpec::ListFiles => "list-files",
            BatchJobSpec::Custom { name, .. } => name,
        }
    }
}

/// Request payload. Closed: every dispatch site matches all variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Store a file; checksum archives keep only its checksum.
    Store {
        /// The file to store.
        file: FileRef,
        /// Checksum the replica must verify the content against.
        precomputed_checksum: Option<Checksum>,
    },
    /// Read a stored file from an offset.
    Retrieve {
        /// Stored filename.
        file_id: String,
        /// Byte offset to read from.
        offset: u64,
    },
    /// Run a batch job over the replica's files.
    RunBatch {
        /// Job the partial result belongs to.
        job_id: JobId,
        /// What to run.
        spec: BatchJobSpec,
        /// Which files to run it on.
        filter: FileFilter,
        /// Where the partial result goes.
        reply_channel: Channel,
    },
    /// Stop a batch job. A no-op for unknown or finished jobs.
    TerminateBatch {
        /// The job to stop.
        job_id: JobId,
    },
    /// Replace a divergent copy or checksum.
    Correct {
        /// File to correct.
        filename: String,
        /// Checksum the replica should end up with.
        expected_checksum: Checksum,
        /// The value the replica reported before; it refuses when its own
        /// checksum no longer equals this.
        reported_checksum: Checksum,
        /// Good content, for bit archives.
        replacement: Option<FileRef>,
    },
    /// Report one file's checksum.
    GetChecksum {
        /// File to report.
        filename: String,
    },
    /// Report every checksum, sorted by filename.
    GetAllChecksums,
    /// Report every filename, sorted.
    GetAllFilenames,
}

impl Payload {
    /// Variant name for logs and error text.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Store { .. } => "Store",
            Payload::Retrieve { .. } => "Retrieve",
            Payload::RunBatch { .. } => "RunBatch",
            Payload::TerminateBatch { .. } => "TerminateBatch",
            Payload::Correct { .. } => "Correct",
            Payload::GetChecksum { .. } => "GetChecksum",
            Payload::GetAllChecksums => "GetAllChecksums",
            Payload::GetAllFilenames => "GetAllFilenames",
        }
    }
}

/// One file a batch job could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    /// The file.
    pub filename: String,
    /// Why it failed.
    pub error: String,
}

/// Partial result of a batch job from one pillar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// The job.
    pub job_id: JobId,
    /// Pillar that ran it.
    pub replica: ReplicaId,
    /// Files processed successfully.
    pub files_processed: u64,
    /// Files that could not be processed.
    pub failures: Vec<FileFailure>,
    /// Job output.
    #[serde(with = "serde_bytes")]
    pub output: Vec<u8>,
}

/// Reply payload, set by the party answering a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The file was stored.
    Stored {
        /// Stored filename.
        filename: String,
        /// Checksum the replica computed.
        checksum: Checksum,
    },
    /// File content from the requested offset on.
    Record {
        /// Stored filename.
        file_id: String,
        /// Offset the data starts at.
        offset: u64,
        /// The content.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Partial result of a batch job.
    Batch(BatchReport),
    /// Termination acknowledged.
    Terminated {
        /// The job.
        job_id: JobId,
        /// Pillar acknowledging.
        replica: ReplicaId,
    },
    /// The copy now has this checksum.
    Corrected {
        /// Corrected file.
        filename: String,
        /// Its checksum after correction.
        checksum: Checksum,
    },
    /// One file's checksum.
    Checksum {
        /// The file.
        filename: String,
        /// Its checksum.
        checksum: Checksum,
    },
    /// `filename,checksum` lines.
    ChecksumListing {
        /// Pillar listing.
        replica: ReplicaId,
        /// One record per line, sorted by filename.
        lines: String,
    },
    /// One filename per line.
    FilenameListing {
        /// Pillar listing.
        replica: ReplicaId,
        /// Sorted filenames.
        lines: String,
    },
}

/// The request/reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    to: Channel,
    reply_to: Channel,
    ok: bool,
    error_text: Option<String>,
    payload: Payload,
    reply: Option<Reply>,
    replied: bool,
}

impl Message {
    pub(crate) fn new(id: MessageId, to: Channel, reply_to: Channel, payload: Payload) -> Self {
        Self {
            id,
            to,
            reply_to,
            ok: true,
            error_text: None,
            payload,
            reply: None,
            replied: false,
        }
    }

    /// Correlation id.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Destination channel.
    pub fn to(&self) -> &Channel {
        &self.to
    }

    /// Where replies go.
    pub fn reply_to(&self) -> &Channel {
        &self.reply_to
    }

    /// False once the answering party marked the message as failed.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Error text of a failed message.
    pub fn error_text(&self) -> Option<&str> {
        self.error_text.as_deref()
    }

    /// Request payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Reply payload, if answered successfully (or with partial results).
    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// True once `set_reply`, `set_not_ok` or `set_failed` has been called.
    pub fn is_replied(&self) -> bool {
        self.replied
    }

    /// Record a successful reply.
    pub fn set_reply(&mut self, reply: Reply) -> Result<()> {
        self.mark_replied()?;
        self.reply = Some(reply);
        Ok(())
    }

    /// Record a failure without any reply payload.
    pub fn set_not_ok(&mut self, error_text: impl Into<String>) -> Result<()> {
        self.mark_replied()?;
        self.ok = false;
        self.error_text = Some(error_text.into());
        Ok(())
    }

    /// Record a failure that still carries partial results.
    pub fn set_failed(&mut self, reply: Reply, error_text: impl Into<String>) -> Result<()> {
        self.mark_replied()?;
        self.ok = false;
        self.error_text = Some(error_text.into());
        self.reply = Some(reply);
        Ok(())
    }

    pub(crate) fn retarget(&mut self, to: Channel) {
        self.to = to;
    }

    fn mark_replied(&mut self) -> Result<()> {
        if self.replied {
            return Err(BusError::AlreadyReplied {
                id: self.id.to_string(),
            });
        }
        self.replied = true;
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] to={} reply_to={} ok={}",
            self.payload.kind_name(),
            self.id,
            self.to,
            self.reply_to,
            self.ok
        )?;
        if let Some(text) = &self.error_text {
            write!(f, " error={}", text)?;
        }
        Ok(())
    }
}
