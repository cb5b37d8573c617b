//! Correlates replies with the requests that caused them.
//!
//! A [`ReplyRouter`] is the listener on a caller's reply channel. Waiters
//! register the ids of messages they sent and get a [`ReplyStream`]; every
//! reply carrying a registered id is forwarded to that stream. Batch traffic is
//! handed to the fallback listener. Other replies nobody waits for are parked
//! briefly, since a reply may overtake the registration of its own request,
//! and are dropped with a log line once the parking lot is full.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arcgrid_bus::{Message, MessageId, MessageListener, Payload};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::{ReplError, Result};

const DEFAULT_PARKED: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RouterInner {
    waiting: Mutex<HashMap<MessageId, mpsc::UnboundedSender<Message>>>,
    parked: Mutex<VecDeque<Message>>,
    max_parked: usize,
    fallback: Mutex<Option<Arc<dyn MessageListener>>>,
}

impl RouterInner {
    fn forget(&self, ids: &[MessageId]) {
        let mut waiting = lock(&self.waiting);
        for id in ids {
            waiting.remove(id);
        }
    }
}

/// Routes replies on one channel to whoever waits for them.
#[derive(Clone)]
pub struct ReplyRouter {
    inner: Arc<RouterInner>,
}

impl Default for ReplyRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyRouter {
    /// Create a router with the default parking capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PARKED)
    }

    /// Create a router parking at most `max_parked` unclaimed replies.
    pub fn with_capacity(max_parked: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                waiting: Mutex::new(HashMap::new()),
                parked: Mutex::new(VecDeque::new()),
                max_parked,
                fallback: Mutex::new(None),
            }),
        }
    }

    /// Listener receiving batch replies.
    pub fn set_fallback(&self, listener: Arc<dyn MessageListener>) {
        *lock(&self.inner.fallback) = Some(listener);
    }

    /// Wait for replies to one message.
    pub fn register(&self, id: MessageId) -> ReplyStream {
        self.register_all(std::iter::once(id))
    }

    /// Wait for replies to several messages on one stream.
    pub fn register_all(&self, ids: impl IntoIterator<Item = MessageId>) -> ReplyStream {
        let ids: Vec<MessageId> = ids.into_iter().collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut waiting = lock(&self.inner.waiting);
        for id in &ids {
            waiting.insert(id.clone(), tx.clone());
        }

        lock(&self.inner.parked).retain(|msg| {
            if ids.contains(msg.id()) {
                let _ = tx.send(msg.clone());
                false
            } else {
                true
            }
        });
        drop(waiting);

        ReplyStream {
            ids,
            rx,
            router: Arc::clone(&self.inner),
        }
    }

    /// Number of ids currently awaited.
    pub fn pending(&self) -> usize {
        lock(&self.inner.waiting).len()
    }

    /// Number of parked replies.
    pub fn parked(&self) -> usize {
        lock(&self.inner.parked).len()
    }
}

impl MessageListener for ReplyRouter {
    fn on_message(&self, msg: Message) {
        let waiting = lock(&self.inner.waiting);
        if let Some(tx) = waiting.get(msg.id()) {
            trace!(msg = %msg, "reply routed");
            let _ = tx.send(msg);
            return;
        }

        if matches!(
            msg.payload(),
            Payload::RunBatch { .. } | Payload::TerminateBatch { .. }
        ) {
            let fallback = lock(&self.inner.fallback).clone();
            if let Some(listener) = fallback {
                drop(waiting);
                listener.on_message(msg);
                return;
            }
        }

        // Parked under the waiting lock so a concurrent register cannot miss it.
        if self.inner.max_parked == 0 {
            debug!(msg = %msg, "late reply dropped");
            return;
        }
        let mut parked = lock(&self.inner.parked);
        if parked.len() >= self.inner.max_parked {
            if let Some(old) = parked.pop_front() {
                debug!(msg = %old, "late reply dropped");
            }
        }
        parked.push_back(msg);
    }
}

/// Replies to one or more registered messages.
///
/// Dropping the stream unregisters its ids; replies arriving afterwards are
/// treated as late.
pub struct ReplyStream {
    ids: Vec<MessageId>,
    rx: mpsc::UnboundedReceiver<Message>,
    router: Arc<RouterInner>,
}

impl ReplyStream {
    /// Ids this stream receives replies for.
    pub fn ids(&self) -> &[MessageId] {
        &self.ids
    }

    /// Next reply, ok or not.
    pub async fn next(&mut self, timeout: Duration) -> Result<Message> {
        self.next_before(Instant::now() + timeout, timeout).await
    }

    /// First successful reply. Not-ok replies are skipped.
    pub async fn first_ok(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let msg = self.next_before(deadline, timeout).await?;
            if msg.is_ok() {
                return Ok(msg);
            }
            debug!(msg = %msg, "skipping failed reply");
        }
    }

    /// Every reply until `expected` have arrived or the timeout elapses.
    pub async fn collect(&mut self, expected: usize, timeout: Duration) -> Vec<Message> {
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            match self.next_before(deadline, timeout).await {
                Ok(msg) => replies.push(msg),
                Err(_) => break,
            }
        }
        replies
    }

    /// Next reply before an absolute deadline.
    pub async fn next_before(&mut self, deadline: Instant, timeout: Duration) -> Result<Message> {
        match timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) | Err(_) => Err(ReplError::Timeout {
                what: self.describe(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn describe(&self) -> String {
        match self.ids.as_slice() {
            [one] => format!("message {}", one),
            many => format!("{} messages", many.len()),
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.router.forget(&self.ids);
    }
}
