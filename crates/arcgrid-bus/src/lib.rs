#![warn(missing_docs)]

//! arcgrid message substrate: typed broadcast and point-to-point channels,
//! the request/reply envelope, and the bus that sends, resends and replies.

pub mod bus;
pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

pub use bus::{Bus, BusContext};
pub use channel::{Channel, ChannelKind, ChannelRegistry, ChannelRole, ReplicaId, ReplicaKind};
pub use error::{BusError, Result};
pub use message::{
    BatchJobSpec, BatchReport, Checksum, FileFailure, FileFilter, FileRef, JobId, Message,
    MessageId, MessageIdGenerator, Payload, Reply,
};
pub use transport::{InMemoryTransport, MessageListener, RecordingTransport, Transport};
