//! Error types for the replica coordination layer.

use arcgrid_bus::{BusError, ReplicaId, ReplicaKind};
use thiserror::Error;

/// Errors that can occur while coordinating replicas.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The caller supplied a missing, empty or out-of-range argument.
    /// Raised before anything is sent.
    #[error("invalid argument {name}: {reason}")]
    ArgumentInvalid {
        /// Argument name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The messaging substrate could not deliver a message.
    #[error("transport failure")]
    Transport(#[from] BusError),

    /// The operation is not available on this kind of replica.
    #[error("{operation} is not supported by {kind} replica {replica}")]
    Unsupported {
        /// Payload kind that was attempted.
        operation: &'static str,
        /// Replica kind that refused it.
        kind: ReplicaKind,
        /// Replica that refused it.
        replica: ReplicaId,
    },

    /// No correlated reply arrived in time.
    #[error("no reply to {what} within {timeout_ms}ms")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The caller-supplied timeout.
        timeout_ms: u64,
    },

    /// A single replica reported failure.
    #[error("pillar {replica} failed: {reason}")]
    PillarFailure {
        /// Failing replica.
        replica: ReplicaId,
        /// Error text it reported.
        reason: String,
    },

    /// The replica is not part of the configured grid.
    #[error("unknown replica: {replica}")]
    UnknownReplica {
        /// The unknown replica id.
        replica: ReplicaId,
    },

    /// The batch job is not tracked by this engine.
    #[error("unknown batch job: {job_id}")]
    UnknownJob {
        /// The unknown job id.
        job_id: String,
    },

    /// Checksum reports disagree and no authoritative value can be chosen.
    #[error("no authoritative checksum for {filename}: {reason}")]
    NoAuthority {
        /// File under investigation.
        filename: String,
        /// Why no value wins.
        reason: String,
    },

    /// A divergent replica could not be corrected.
    #[error("correction of {filename} on {replica} failed after {attempts} attempt(s): {reason}")]
    CorrectionFailed {
        /// File being corrected.
        filename: String,
        /// Replica holding the bad copy.
        replica: ReplicaId,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// A checksum or filename listing is malformed or not sorted.
    #[error("malformed listing at line {line}: {reason}")]
    Listing {
        /// 1-based line number.
        line: usize,
        /// What is wrong.
        reason: String,
    },

    /// The grid configuration is invalid.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ReplError::ArgumentInvalid {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ReplError::Config { msg: msg.into() }
    }
}

/// Result alias for the replication layer.
pub type Result<T> = std::result::Result<T, ReplError>;
