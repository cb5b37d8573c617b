//! Delivery substrates behind the bus.
//!
//! [`Transport`] is the seam where a real broker plugs in. Two implementations
//! ship with the crate: [`InMemoryTransport`], which runs one tokio worker per
//! subscription, and [`RecordingTransport`], a test double that records every
//! message handed to it and dispatches nothing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelKind};
use crate::codec::{decode_message, encode_message};
use crate::error::{BusError, Result};
use crate::message::Message;

/// Callback invoked once per delivered message.
pub trait MessageListener: Send + Sync + 'static {
    /// Handle one delivered message.
    fn on_message(&self, msg: Message);
}

impl<F> MessageListener for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_message(&self, msg: Message) {
        self(msg)
    }
}

/// A messaging substrate capable of broadcast and point-to-point delivery.
pub trait Transport: Send + Sync + 'static {
    /// Deliver a message to the channel it is addressed to.
    fn deliver(&self, msg: &Message) -> Result<()>;

    /// Register a listener on a channel.
    fn subscribe(&self, channel: &Channel, listener: Arc<dyn MessageListener>) -> Result<()>;

    /// Unregister a listener. Returns true if it was registered.
    fn unsubscribe(&self, channel: &Channel, listener: &Arc<dyn MessageListener>) -> Result<bool>;
}

fn same_listener(a: &Arc<dyn MessageListener>, b: &Arc<dyn MessageListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Subscription {
    listener: Arc<dyn MessageListener>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<Subscription>,
    next: usize,
    backlog: VecDeque<Message>,
}

/// In-process transport.
///
/// Each subscription owns an unbounded queue drained by its own tokio task, so
/// one subscriber sees messages in send order while different channels are
/// serviced concurrently. Every delivered copy is round-tripped through the
/// wire codec, giving each subscriber an independent message.
#[derive(Default)]
pub struct InMemoryTransport {
    channels: Mutex<HashMap<String, ChannelState>>,
    failing: Mutex<HashSet<String>>,
    down: AtomicBool,
}

impl InMemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail.
    pub fn shutdown(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    /// Make deliveries to one channel fail.
    pub fn fail_channel(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Undo [`fail_channel`](Self::fail_channel).
    pub fn heal_channel(&self, name: &str) {
        lock(&self.failing).remove(name);
    }

    /// Number of listeners on a channel.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        lock(&self.channels)
            .get(channel.name())
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }

    /// Point-to-point messages waiting for a listener.
    pub fn backlog_len(&self, channel: &Channel) -> usize {
        lock(&self.channels)
            .get(channel.name())
            .map(|state| state.backlog.len())
            .unwrap_or(0)
    }

    fn check_reachable(&self, channel: &Channel) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BusError::transport(channel.name(), "transport is shut down"));
        }
        if lock(&self.failing).contains(channel.name()) {
            return Err(BusError::transport(channel.name(), "channel unreachable"));
        }
        Ok(())
    }
}

impl Transport for InMemoryTransport {
    fn deliver(&self, msg: &Message) -> Result<()> {
        let channel = msg.to();
        self.check_reachable(channel)?;
        let wire = encode_message(msg)?;

        let mut channels = lock(&self.channels);
        let state = channels.entry(channel.name().to_string()).or_default();
        state.subscribers.retain(|sub| !sub.tx.is_closed());

        match channel.kind() {
            ChannelKind::Broadcast => {
                if state.subscribers.is_empty() {
                    trace!(channel = %channel, id = %msg.id(), "broadcast with no subscribers dropped");
                }
                for sub in &state.subscribers {
                    let _ = sub.tx.send(decode_message(&wire)?);
                }
            }
            ChannelKind::PointToPoint => {
                let copy = decode_message(&wire)?;
                if state.subscribers.is_empty() {
                    debug!(channel = %channel, id = %msg.id(), "queued until a listener subscribes");
                    state.backlog.push_back(copy);
                } else {
                    let idx = state.next % state.subscribers.len();
                    state.next = state.next.wrapping_add(1);
                    if let Err(mpsc::error::SendError(copy)) = state.subscribers[idx].tx.send(copy) {
                        state.backlog.push_back(copy);
                    }
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &Channel, listener: Arc<dyn MessageListener>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BusError::transport(channel.name(), "no async runtime to run listener"))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let worker_listener = Arc::clone(&listener);
        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                worker_listener.on_message(msg);
            }
        });

        let mut channels = lock(&self.channels);
        let state = channels.entry(channel.name().to_string()).or_default();
        if channel.kind() == ChannelKind::PointToPoint {
            while let Some(queued) = state.backlog.pop_front() {
                let _ = tx.send(queued);
            }
        }
        state.subscribers.push(Subscription { listener, tx });
        Ok(())
    }

    fn unsubscribe(&self, channel: &Channel, listener: &Arc<dyn MessageListener>) -> Result<bool> {
        let mut channels = lock(&self.channels);
        let Some(state) = channels.get_mut(channel.name()) else {
            return Ok(false);
        };
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|sub| !same_listener(&sub.listener, listener));
        Ok(state.subscribers.len() != before)
    }
}

/// Test double that records every delivered message and dispatches nothing.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
    subscriptions: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail (nothing is recorded while failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every message delivered so far, in order.
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }

    /// Messages delivered to one channel.
    pub fn sent_to(&self, channel: &Channel) -> Vec<Message> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.to() == channel)
            .cloned()
            .collect()
    }

    /// Channels that had a listener registered.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    /// Forget recorded messages.
    pub fn clear(&self) {
        lock(&self.sent).clear();
    }
}

impl Transport for RecordingTransport {
    fn deliver(&self, msg: &Message) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::transport(msg.to().name(), "recording transport failing"));
        }
        lock(&self.sent).push(msg.clone());
        Ok(())
    }

    fn subscribe(&self, channel: &Channel, _listener: Arc<dyn MessageListener>) -> Result<()> {
        lock(&self.subscriptions).push(channel.name().to_string());
        Ok(())
    }

    fn unsubscribe(&self, channel: &Channel, _listener: &Arc<dyn MessageListener>) -> Result<bool> {
        let mut subs = lock(&self.subscriptions);
        match subs.iter().position(|name| name == channel.name()) {
            Some(idx) => {
                subs.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
