//! Send, resend, reply and listen over a [`Transport`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelRegistry};
use crate::error::Result;
use crate::message::{Message, MessageIdGenerator, Payload};
use crate::transport::{MessageListener, Transport};

/// The message bus: mints ids and moves messages over a transport.
pub struct Bus {
    transport: Arc<dyn Transport>,
    ids: MessageIdGenerator,
    error_channel: Channel,
}

impl Bus {
    /// Create a bus with a fresh process identity.
    pub fn new(transport: Arc<dyn Transport>, error_channel: Channel) -> Self {
        Self::with_ids(transport, MessageIdGenerator::new(), error_channel)
    }

    /// Create a bus with a given id generator.
    pub fn with_ids(
        transport: Arc<dyn Transport>,
        ids: MessageIdGenerator,
        error_channel: Channel,
    ) -> Self {
        Self {
            transport,
            ids,
            error_channel,
        }
    }

    /// Build a new message with a freshly minted id.
    pub fn message(&self, to: Channel, reply_to: Channel, payload: Payload) -> Message {
        Message::new(self.ids.next_id(), to, reply_to, payload)
    }

    /// The id generator, for callers that need ids not bound to a message.
    pub fn ids(&self) -> &MessageIdGenerator {
        &self.ids
    }

    /// Deliver a message to its destination.
    pub fn send(&self, msg: &Message) -> Result<()> {
        debug!(msg = %msg, "send");
        self.transport.deliver(msg)
    }

    /// Re-target an existing message and send it again under the same id.
    ///
    /// On failure an error reply is attempted to the message's reply-to
    /// channel; a failure of that attempt is logged and dropped. The original
    /// error is returned either way.
    pub fn resend(&self, msg: &mut Message, to: Channel) -> Result<()> {
        msg.retarget(to);
        debug!(msg = %msg, "resend");
        match self.transport.deliver(msg) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(msg = %msg, error = %e, "failure while resending");
                self.notify_failure(msg, &e.to_string());
                Err(e)
            }
        }
    }

    /// Deliver a message to its reply-to channel.
    pub fn reply(&self, msg: &Message) -> Result<()> {
        debug!(msg = %msg, "reply");
        let mut reply = msg.clone();
        reply.retarget(msg.reply_to().clone());
        self.transport.deliver(&reply)
    }

    /// Mark `msg` failed (if no reply was recorded yet) and reply with it.
    /// Never fails: a secondary failure is logged and dropped.
    pub fn notify_failure(&self, msg: &mut Message, error_text: &str) {
        if !msg.is_replied() {
            if let Err(e) = msg.set_not_ok(error_text) {
                warn!(msg = %msg, error = %e, "could not mark message failed");
            }
        }
        if let Err(e) = self.reply(msg) {
            warn!(msg = %msg, error = %e, "failed to send error message back");
        }
    }

    /// Post a failed message to the ERROR channel, best effort.
    pub fn report_error(&self, msg: &Message) {
        let mut copy = msg.clone();
        copy.retarget(self.error_channel.clone());
        if let Err(e) = self.transport.deliver(&copy) {
            warn!(msg = %msg, error = %e, "could not report to error channel");
        }
    }

    /// Register a listener on a channel.
    pub fn set_listener(&self, channel: &Channel, listener: Arc<dyn MessageListener>) -> Result<()> {
        debug!(channel = %channel, "listener registered");
        self.transport.subscribe(channel, listener)
    }

    /// Unregister a listener. Returns true if it was registered.
    pub fn remove_listener(
        &self,
        channel: &Channel,
        listener: &Arc<dyn MessageListener>,
    ) -> Result<bool> {
        self.transport.unsubscribe(channel, listener)
    }
}

/// Everything a component needs to talk on the grid, constructed once at startup.
#[derive(Clone)]
pub struct BusContext {
    /// The bus every component sends through.
    pub bus: Arc<Bus>,
    /// Channel lookup for this environment.
    pub channels: Arc<ChannelRegistry>,
}

impl BusContext {
    /// Build a context for an environment over a transport.
    pub fn new(environment: &str, transport: Arc<dyn Transport>) -> Self {
        let channels = Arc::new(ChannelRegistry::new(environment));
        let bus = Arc::new(Bus::new(transport, channels.error()));
        Self { bus, channels }
    }
}
