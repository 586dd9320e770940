//! Commit Coordinator
//!
//! Drives a distributed transaction through prepare, precommit and commit.
//! The coordinator never retries: a failed phase is reported to the caller,
//! and once precommit is durably recorded the only way out is forward.

use std::sync::Arc;
use tokio::sync::watch;

use super::barrier::CommitBarrier;
use super::gather::{stopped, GatherOutcome, GatherPhase, QuorumGatherer};
use super::message::{Gid, LocalXid};
use super::transaction::{CommitState, Transaction};
use crate::channel::MessageChannel;
use crate::config::CommitSettings;
use crate::error::{Error, Result};
use crate::state::{ClusterState, NodeId, NodeMask, NodeStatus};
use crate::txlog::DurableLog;

/// How a transaction was committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Not coordinated: commit with the local engine only
    Local,
    /// Committed through the three-phase protocol
    Committed {
        /// Nodes that acknowledged every phase
        participants: NodeMask,
        /// Nodes dropped on the way after being disabled
        dropped: NodeMask,
    },
}

/// Three-phase commit coordinator
pub struct CommitCoordinator<C: MessageChannel> {
    node_id: NodeId,
    cluster: Arc<ClusterState>,
    barrier: CommitBarrier,
    log: Arc<dyn DurableLog>,
    channel: C,
    settings: CommitSettings,
    gatherer: QuorumGatherer,
    shutdown: watch::Receiver<bool>,
}

impl<C: MessageChannel> CommitCoordinator<C> {
    /// Create a new coordinator
    pub fn new(
        cluster: Arc<ClusterState>,
        barrier: CommitBarrier,
        log: Arc<dyn DurableLog>,
        channel: C,
        settings: CommitSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let gatherer = QuorumGatherer::new(cluster.clone(), shutdown.clone());
        Self {
            node_id: cluster.node_id(),
            cluster,
            barrier,
            log,
            channel,
            settings,
            gatherer,
            shutdown,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn barrier(&self) -> &CommitBarrier {
        &self.barrier
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    /// Start tracking a transaction. Distributed transactions are refused
    /// while this node is not Online.
    pub async fn begin_transaction(&self, xid: LocalXid, distributed: bool) -> Result<Transaction> {
        if distributed {
            let status = self.cluster.own_status().await;
            if status != NodeStatus::Online {
                return Err(Error::NodeNotOnline(status));
            }
        }
        Ok(Transaction::new(self.node_id, xid, distributed))
    }

    /// Compute the participants of `tx` from one cluster snapshot.
    pub async fn begin_commit(&self, tx: &mut Transaction) -> Result<NodeMask> {
        let snapshot = self.cluster.snapshot().await;
        if snapshot.own_status != NodeStatus::Online {
            return Err(Error::NodeNotOnline(snapshot.own_status));
        }

        let participants = snapshot.participants(self.node_id);
        tx.set_participants(participants);
        tracing::debug!("{}: participants {}", tx.gid(), participants);
        Ok(participants)
    }

    /// Commit `tx`, coordinating with every online node when it is a
    /// distributed transaction with writes.
    ///
    /// A fatal error also takes this node out of the cluster: it stays
    /// Disabled until [`super::recovery::enable_node`] brings it back.
    pub async fn commit(&self, tx: &mut Transaction) -> Result<CommitOutcome> {
        let result = self.run_protocol(tx).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.leave_cluster(tx.gid(), e).await;
            }
        }
        result
    }

    async fn run_protocol(&self, tx: &mut Transaction) -> Result<CommitOutcome> {
        if !tx.needs_coordination() {
            tracing::trace!("{}: committing locally", tx.gid());
            return Ok(CommitOutcome::Local);
        }
        if tx.state() != CommitState::Idle {
            return Err(Error::InvalidTransition {
                from: tx.state(),
                to: CommitState::Preparing,
            });
        }

        self.wait_for_admission().await?;
        let _barrier = self.barrier.shared().await;

        let participants = self.begin_commit(tx).await?;
        let gid = *tx.gid();
        let mut subscription = self.channel.subscribe(&gid.stream_name())?;

        // Phase 1: prepare
        tx.advance(CommitState::Preparing)?;
        if let Err(e) = self.log.prepare(&gid).await {
            tracing::warn!("{}: local prepare failed: {}", gid, e);
            tx.advance(CommitState::Aborted)?;
            return Err(Error::LocalPrepareFailed {
                gid: gid.to_string(),
                reason: e.to_string(),
            });
        }
        tx.advance(CommitState::Prepared)?;

        let prepare = match self
            .gatherer
            .gather(&mut subscription, &gid, participants, GatherPhase::Prepare)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abort_prepared(tx).await;
                return Err(e);
            }
        };
        if let Err(e) = self.check_prepare(&gid, &prepare).await {
            self.abort_prepared(tx).await;
            return Err(e);
        }

        // Phase 2: precommit. No abort from here on.
        let mut live = participants.difference(prepare.dropped);
        tx.advance(CommitState::Precommitting)?;
        self.log.precommit(&gid).await?;
        let precommit = self
            .gatherer
            .gather(&mut subscription, &gid, live, GatherPhase::Precommit)
            .await?;
        live = live.difference(precommit.dropped);
        tx.advance(CommitState::Precommitted)?;

        // Phase 3: commit
        tx.advance(CommitState::Committing)?;
        self.log.commit_prepared(&gid).await?;
        let commit = self
            .gatherer
            .gather(&mut subscription, &gid, live, GatherPhase::Commit)
            .await?;
        live = live.difference(commit.dropped);
        tx.advance(CommitState::Committed)?;

        let dropped = prepare
            .dropped
            .union(precommit.dropped)
            .union(commit.dropped);
        tracing::debug!("{}: committed on {} (dropped {})", gid, live, dropped);

        Ok(CommitOutcome::Committed {
            participants: live,
            dropped,
        })
    }

    /// Block while node recovery fences new commits
    async fn wait_for_admission(&self) -> Result<()> {
        if !self.cluster.commits_blocked() {
            return Ok(());
        }

        tracing::debug!("New commits are blocked, waiting");
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = self.cluster.wait_until_commits_unblocked() => result,
            _ = stopped(&mut shutdown) => Err(Error::Cancelled),
        }
    }

    /// Decide whether the prepare round allows going on
    async fn check_prepare(&self, gid: &Gid, prepare: &GatherOutcome) -> Result<()> {
        if let Some(node) = prepare.failed_at {
            return Err(Error::PeerAborted {
                gid: gid.to_string(),
                node,
            });
        }

        if self.settings.abort_on_prepare_drop {
            if let Some(node) = prepare.dropped.first() {
                tracing::warn!("{}: node {} dropped out during prepare", gid, node);
                return Err(Error::PeerAborted {
                    gid: gid.to_string(),
                    node,
                });
            }
        }

        if self.settings.require_majority {
            let required = self.cluster.snapshot().await.node_count / 2 + 1;
            let reached = prepare.acknowledged.len() + 1;
            if reached < required {
                return Err(Error::QuorumNotReached { reached, required });
            }
        }

        Ok(())
    }

    /// Stop taking part in commits after a fatal error
    async fn leave_cluster(&self, gid: &Gid, error: &Error) {
        tracing::error!("{}: fatal commit error, disabling node {}: {}", gid, self.node_id, error);
        if let Err(e) = self.cluster.set_status(self.node_id, NodeStatus::Disabled).await {
            tracing::error!("Failed to disable node {}: {}", self.node_id, e);
        }
    }

    /// Best effort abort of a locally prepared transaction
    async fn abort_prepared(&self, tx: &mut Transaction) {
        let gid = *tx.gid();
        if let Err(e) = self.log.abort_prepared(&gid).await {
            tracing::error!("{}: failed to abort prepared transaction: {}", gid, e);
        }
        if let Err(e) = tx.advance(CommitState::Aborted) {
            tracing::error!("{}: {}", gid, e);
        }
    }
}
