//! Message Channel Module
//!
//! Per-transaction streams of arbiter messages coming from remote nodes.
//! Each remote node has one reliable, ordered stream; when the connection to
//! a node is lost the stream reports it as detached instead of delivering.

mod hub;

pub use hub::{HubSubscription, MessageHub};

use async_trait::async_trait;

use crate::commit::ArbiterMessage;
use crate::error::Result;
use crate::state::{NodeId, NodeMask};

/// Outcome of waiting on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A message arrived on the stream of node `from`
    Message { from: NodeId, message: ArbiterMessage },
    /// The stream of this node is detached
    Detached(NodeId),
    /// The stream of a node reported detached before is attached again
    Attached(NodeId),
}

/// A subscription to one transaction's stream.
///
/// Dropping the subscription tears the stream down.
#[async_trait]
pub trait Subscription: Send {
    /// Stream name
    fn stream(&self) -> &str;

    /// Wait for the next message from any node in `mask`, or for a node of
    /// `mask` to change sides of `detached`: reported as `Detached` when it
    /// loses its stream while outside `detached`, as `Attached` when it is
    /// in `detached` and its stream is back. Must be cancel safe.
    async fn pop(&mut self, mask: NodeMask, detached: NodeMask) -> Result<Delivery>;
}

/// Source of per-transaction subscriptions
pub trait MessageChannel: Send + Sync {
    type Subscription: Subscription;

    /// Subscribe to a stream
    fn subscribe(&self, stream: &str) -> Result<Self::Subscription>;
}
