#![warn(missing_docs)]

//! arcgrid replica coordination: replica clients, batch fan-out, checksum consistency, quorum evaluation
//!
//! This crate sits on top of `arcgrid-bus`. It talks to bit archive and
//! checksum archive replicas, correlates their replies, merges batch job
//! results, detects and corrects divergent checksums, and judges every
//! multi-pillar operation against a per-collection quorum policy.

pub mod batch;
pub mod checksum;
pub mod client;
pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod quorum;
pub mod sim;

pub use batch::{BatchJobEngine, BatchOutcome, BatchReplyListener, BatchTarget, FilterMatcher, ReplyDisposition};
pub use checksum::{digest, ChecksumRecord};
pub use client::{client_for, BatchJob, BatchJobState, BitArchiveClient, ChecksumArchiveClient, Replica, ReplicaClient};
pub use config::{CollectionConfig, GridConfig, ReplicaConfig};
pub use consistency::{sweep, sweep_filenames, Authority, ConsistencyChecker, ConsistencyFailure, Divergence, FileState, NameFinding, SweepFinding};
pub use coordinator::{GridCoordinator, NameSweepReport, OperationReport, SweepReport, VerifyReport};
pub use correlation::{ReplyRouter, ReplyStream};
pub use error::{ReplError, Result};
pub use quorum::{evaluate, evaluate_final, FailureCause, OperationOutcome, QuorumPolicy, Verdict};
pub use sim::SimulatedPillar;
