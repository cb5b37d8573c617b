//! Wire encoding of messages.
//!
//! Messages are serialized with bincode. Only the logical fields need to
//! survive a round trip; the encoding itself is private to the transport.

use crate::error::{BusError, Result};
use crate::message::Message;

/// Encode a message for the wire.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| BusError::Codec(e.to_string()))
}

/// Decode a message from the wire.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    bincode::deserialize(data).map_err(|e| BusError::Codec(e.to_string()))
}
