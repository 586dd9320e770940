//! Participant
//!
//! Replica side of the commit protocol. The replication apply layer calls
//! into it as the origin's prepare, precommit, commit and abort records
//! arrive; every step is acknowledged to the origin node.

use std::sync::Arc;
use async_trait::async_trait;

use crate::channel::MessageHub;
use crate::commit::{ArbiterMessage, Gid, MessageCode};
use crate::error::{Error, Result};
use crate::network::ArbiterClient;
use crate::state::{ClusterState, NodeId, NodeStatus};
use crate::txlog::DurableLog;

/// Outbound path for acknowledgements
#[async_trait]
pub trait ArbiterSender: Send + Sync {
    async fn send_to(&self, to: NodeId, message: ArbiterMessage) -> Result<()>;
}

#[async_trait]
impl ArbiterSender for ArbiterClient {
    async fn send_to(&self, to: NodeId, message: ArbiterMessage) -> Result<()> {
        self.send(to, message).await
    }
}

/// Loopback into the hub of node `to`, used when both ends share a process
#[async_trait]
impl ArbiterSender for MessageHub {
    async fn send_to(&self, to: NodeId, message: ArbiterMessage) -> Result<()> {
        if to != self.node_id() {
            return Err(Error::NodeNotFound(to));
        }
        self.deliver(message.node, message);
        Ok(())
    }
}

/// Replica-side protocol handler
pub struct Participant {
    node_id: NodeId,
    cluster: Arc<ClusterState>,
    log: Arc<dyn DurableLog>,
    sender: Arc<dyn ArbiterSender>,
}

impl Participant {
    pub fn new(
        cluster: Arc<ClusterState>,
        log: Arc<dyn DurableLog>,
        sender: Arc<dyn ArbiterSender>,
    ) -> Self {
        Self {
            node_id: cluster.node_id(),
            cluster,
            log,
            sender,
        }
    }

    /// Prepare a replicated transaction and vote on it
    pub async fn on_prepare(&self, gid: &Gid) -> Result<MessageCode> {
        self.check_origin(gid)?;

        let status = self.cluster.own_status().await;
        let code = if status != NodeStatus::Online {
            tracing::warn!("Refusing to prepare {}: node is {}", gid, status);
            MessageCode::Aborted
        } else {
            match self.log.prepare(gid).await {
                Ok(()) => MessageCode::Prepared,
                Err(e) => {
                    tracing::warn!("Failed to prepare {}: {}", gid, e);
                    MessageCode::Aborted
                }
            }
        };

        self.reply(gid, code).await?;
        Ok(code)
    }

    /// Record the origin's precommit
    pub async fn on_precommit(&self, gid: &Gid) -> Result<()> {
        self.check_origin(gid)?;
        self.log.precommit(gid).await?;
        self.reply(gid, MessageCode::Precommitted).await
    }

    /// Commit the prepared transaction
    pub async fn on_commit(&self, gid: &Gid) -> Result<()> {
        self.check_origin(gid)?;
        self.log.commit_prepared(gid).await?;
        self.reply(gid, MessageCode::Committed).await
    }

    /// Abort the prepared transaction. Nothing is sent back.
    pub async fn on_abort(&self, gid: &Gid) -> Result<()> {
        self.check_origin(gid)?;
        self.log.abort_prepared(gid).await
    }

    fn check_origin(&self, gid: &Gid) -> Result<()> {
        if gid.origin() == self.node_id {
            return Err(Error::ProtocolViolation(format!(
                "node {} received its own transaction {} for apply",
                self.node_id, gid
            )));
        }
        Ok(())
    }

    async fn reply(&self, gid: &Gid, code: MessageCode) -> Result<()> {
        tracing::trace!("Replying {} for {} to node {}", code, gid, gid.origin());
        self.sender
            .send_to(gid.origin(), ArbiterMessage::new(*gid, self.node_id, code))
            .await
    }
}
