//! Error types for the message bus.

use thiserror::Error;

/// Errors raised by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport failure on channel {channel}: {reason}")]
    TransportFailure { channel: String, reason: String },

    #[error("message {id} already carries a reply")]
    AlreadyReplied { id: String },

    #[error("codec error: {0}")]
    Codec(String),
}

impl BusError {
    pub(crate) fn transport(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        BusError::TransportFailure {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
