//! Message Hub
//!
//! In-process multiplexer for arbiter messages: one FIFO queue per
//! (stream, sender) pair plus the set of currently attached senders.
//! The network server feeds it; commit coordinators pop from it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, MessageChannel, Subscription};
use crate::commit::ArbiterMessage;
use crate::error::{Error, Result};
use crate::state::{NodeId, NodeMask};

type StreamQueues = HashMap<NodeId, VecDeque<ArbiterMessage>>;

struct HubState {
    /// Subscribed streams
    streams: HashMap<String, StreamQueues>,
    /// Senders with a live connection
    attached: NodeMask,
}

struct HubInner {
    node_id: NodeId,
    state: Mutex<HubState>,
    notify: Notify,
}

/// Message hub handle
///
/// This is a cloneable handle to the shared queues.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

impl MessageHub {
    /// Create a hub for `node_id` with no sender attached
    pub fn new(node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(HubInner {
                node_id,
                state: Mutex::new(HubState {
                    streams: HashMap::new(),
                    attached: NodeMask::EMPTY,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Get the node this hub receives for
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the stream of `node` as connected
    pub fn attach(&self, node: NodeId) {
        self.state().attached.insert(node);
        tracing::debug!("Hub {}: node {} attached", self.inner.node_id, node);
        self.inner.notify.notify_waiters();
    }

    /// Mark the stream of `node` as detached
    pub fn detach(&self, node: NodeId) {
        self.state().attached.remove(node);
        tracing::debug!("Hub {}: node {} detached", self.inner.node_id, node);
        self.inner.notify.notify_waiters();
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.state().attached.contains(node)
    }

    /// Queue a message received from `from`.
    ///
    /// Messages for streams nobody is subscribed to belong to transactions
    /// that already finished and are dropped. Returns whether it was queued.
    pub fn deliver(&self, from: NodeId, message: ArbiterMessage) -> bool {
        let stream = message.gid.stream_name();
        let queued = {
            let mut state = self.state();
            match state.streams.get_mut(&stream) {
                Some(queues) => {
                    queues.entry(from).or_default().push_back(message);
                    true
                }
                None => false,
            }
        };

        if queued {
            self.inner.notify.notify_waiters();
        } else {
            tracing::debug!("Hub {}: dropping message for unsubscribed stream {}", self.inner.node_id, stream);
        }
        queued
    }

    /// Check whether a stream is subscribed
    pub fn is_subscribed(&self, stream: &str) -> bool {
        self.state().streams.contains_key(stream)
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state().streams.len()
    }

    fn try_pop(&self, stream: &str, mask: NodeMask, detached: NodeMask) -> Result<Option<Delivery>> {
        let mut state = self.state();
        let attached = state.attached;
        let queues = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::Channel(format!("stream {} is not subscribed", stream)))?;

        // Messages sent before a disconnect are still delivered
        for node in mask {
            if let Some(message) = queues.get_mut(&node).and_then(|q| q.pop_front()) {
                return Ok(Some(Delivery::Message { from: node, message }));
            }
        }

        if let Some(node) = mask.difference(attached).difference(detached).first() {
            return Ok(Some(Delivery::Detached(node)));
        }
        Ok(mask
            .intersection(detached)
            .intersection(attached)
            .first()
            .map(Delivery::Attached))
    }

    fn unsubscribe(&self, stream: &str) {
        if let Some(queues) = self.state().streams.remove(stream) {
            let pending: usize = queues.values().map(|q| q.len()).sum();
            if pending > 0 {
                tracing::debug!("Stream {} torn down with {} unread messages", stream, pending);
            }
        }
    }
}

impl MessageChannel for MessageHub {
    type Subscription = HubSubscription;

    fn subscribe(&self, stream: &str) -> Result<HubSubscription> {
        let mut state = self.state();
        if state.streams.contains_key(stream) {
            return Err(Error::Channel(format!("stream {} is already subscribed", stream)));
        }
        state.streams.insert(stream.to_string(), HashMap::new());
        tracing::trace!("Subscribed for {}", stream);

        Ok(HubSubscription {
            hub: self.clone(),
            stream: stream.to_string(),
        })
    }
}

/// Subscription to one stream of a [`MessageHub`]
pub struct HubSubscription {
    hub: MessageHub,
    stream: String,
}

#[async_trait]
impl Subscription for HubSubscription {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn pop(&mut self, mask: NodeMask, detached: NodeMask) -> Result<Delivery> {
        if mask.is_empty() {
            return Err(Error::Channel("pop with an empty node mask".into()));
        }

        loop {
            // Register for wakeups before looking, so nothing slips in between
            let notified = self.hub.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.hub.try_pop(&self.stream, mask, detached)? {
                return Ok(delivery);
            }

            notified.await;
        }
    }
}

impl Drop for HubSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.stream);
        tracing::trace!("Unsubscribed from {}", self.stream);
    }
}
