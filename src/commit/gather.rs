//! Quorum Gatherer
//!
//! Waits for one acknowledgement per participant of a phase. A participant
//! leaves the wait either by answering or by having its stream detached
//! while cluster state shows it is no longer Online. A detached node that is
//! still Online stays expected: the gather keeps listening to it and checks
//! it again on every membership change.

use std::sync::Arc;
use tokio::sync::watch;

use super::message::{ArbiterMessage, Gid, MessageCode};
use super::transaction::CommitState;
use crate::channel::{Delivery, Subscription};
use crate::error::{Error, Result};
use crate::state::{ClusterState, NodeId, NodeMask, NodeStatus};

/// Protocol phase a gather collects acknowledgements for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherPhase {
    Prepare,
    Precommit,
    Commit,
}

impl GatherPhase {
    /// Codes a participant may answer with in this phase
    pub fn accepts(self, code: MessageCode) -> bool {
        match self {
            GatherPhase::Prepare => matches!(code, MessageCode::Prepared | MessageCode::Aborted),
            GatherPhase::Precommit => code == MessageCode::Precommitted,
            GatherPhase::Commit => code == MessageCode::Committed,
        }
    }

    /// Replayed acknowledgement from an earlier phase of the same transaction
    fn is_stale(self, code: MessageCode) -> bool {
        match self {
            GatherPhase::Prepare => false,
            GatherPhase::Precommit => code == MessageCode::Prepared,
            GatherPhase::Commit => matches!(code, MessageCode::Prepared | MessageCode::Precommitted),
        }
    }

    /// Coordinator state while this phase is gathered
    fn commit_state(self) -> CommitState {
        match self {
            GatherPhase::Prepare => CommitState::Prepared,
            GatherPhase::Precommit => CommitState::Precommitting,
            GatherPhase::Commit => CommitState::Committing,
        }
    }
}

impl std::fmt::Display for GatherPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatherPhase::Prepare => write!(f, "prepare"),
            GatherPhase::Precommit => write!(f, "precommit"),
            GatherPhase::Commit => write!(f, "commit"),
        }
    }
}

/// Result of one gather
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherOutcome {
    /// Nodes that answered with the phase's positive code
    pub acknowledged: NodeMask,
    /// Nodes removed because they were detached and confirmed not Online
    pub dropped: NodeMask,
    /// First node that answered Aborted
    pub failed_at: Option<NodeId>,
}

enum Event {
    Delivery(Result<Delivery>),
    ClusterChanged(bool),
    Shutdown,
}

/// Collects per-phase acknowledgements against cluster state
#[derive(Clone)]
pub struct QuorumGatherer {
    cluster: Arc<ClusterState>,
    shutdown: watch::Receiver<bool>,
}

impl QuorumGatherer {
    pub fn new(cluster: Arc<ClusterState>, shutdown: watch::Receiver<bool>) -> Self {
        Self { cluster, shutdown }
    }

    /// Wait until every node of `mask` answered or was dropped.
    ///
    /// An empty mask returns at once without touching the subscription.
    pub async fn gather<S: Subscription>(
        &self,
        subscription: &mut S,
        gid: &Gid,
        mask: NodeMask,
        phase: GatherPhase,
    ) -> Result<GatherOutcome> {
        let mut outcome = GatherOutcome::default();
        if mask.is_empty() {
            return Ok(outcome);
        }

        let mut changes = self.cluster.subscribe_changes();
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }

        let mut remaining = mask;
        // Detached but not yet confirmed gone
        let mut suspects = NodeMask::EMPTY;

        // Changes from here on are seen by `changes`
        self.reconcile(gid, phase, &mut remaining, &mut suspects, &mut outcome)
            .await?;

        tracing::trace!("{}: gathering {} from {}", gid, phase, mask);

        while !remaining.is_empty() {
            let before = remaining;

            let event = tokio::select! {
                delivery = subscription.pop(remaining, suspects) => Event::Delivery(delivery),
                changed = changes.changed() => Event::ClusterChanged(changed.is_ok()),
                _ = stopped(&mut shutdown) => Event::Shutdown,
            };

            match event {
                Event::Delivery(delivery) => match delivery? {
                    Delivery::Message { from, message } => {
                        if phase.is_stale(message.code) && message.gid == *gid && message.node == from {
                            tracing::trace!("{}: skipping replayed {} from node {}", gid, message.code, from);
                            continue;
                        }
                        validate(gid, phase, remaining, from, &message)?;

                        remaining.remove(from);
                        suspects.remove(from);
                        if message.code == MessageCode::Aborted {
                            tracing::debug!("{}: node {} aborted", gid, from);
                            outcome.failed_at.get_or_insert(from);
                        } else {
                            tracing::trace!("{}: {} from node {}", gid, message.code, from);
                            outcome.acknowledged.insert(from);
                        }
                    }
                    Delivery::Detached(node) => {
                        if remaining.contains(node) {
                            tracing::trace!("{}: stream of node {} detached", gid, node);
                            suspects.insert(node);
                            self.reconcile(gid, phase, &mut remaining, &mut suspects, &mut outcome)
                                .await?;
                        }
                    }
                    Delivery::Attached(node) => {
                        tracing::trace!("{}: stream of node {} is back", gid, node);
                        suspects.remove(node);
                    }
                },
                Event::ClusterChanged(true) => {
                    self.reconcile(gid, phase, &mut remaining, &mut suspects, &mut outcome)
                        .await?;
                }
                Event::ClusterChanged(false) => return Err(Error::ShuttingDown),
                Event::Shutdown => {
                    tracing::debug!("{}: {} gather interrupted by shutdown", gid, phase);
                    return Err(Error::Cancelled);
                }
            }

            debug_assert!(remaining.is_subset(before));
        }

        Ok(outcome)
    }

    /// Check own status and drop suspects that cluster state confirms gone
    async fn reconcile(
        &self,
        gid: &Gid,
        phase: GatherPhase,
        remaining: &mut NodeMask,
        suspects: &mut NodeMask,
        outcome: &mut GatherOutcome,
    ) -> Result<()> {
        let snapshot = self.cluster.snapshot().await;
        if snapshot.own_status != NodeStatus::Online {
            tracing::error!(
                "{}: our node became {} during {} gather",
                gid,
                snapshot.own_status,
                phase
            );
            return Err(Error::SelfDisabled {
                gid: gid.to_string(),
                state: phase.commit_state(),
            });
        }

        for node in suspects.intersection(snapshot.disabled) {
            remaining.remove(node);
            suspects.remove(node);
            outcome.dropped.insert(node);
            tracing::warn!("{}: dropping node {} from {} gather, it is no longer online", gid, node, phase);
        }
        Ok(())
    }
}

fn validate(
    gid: &Gid,
    phase: GatherPhase,
    remaining: NodeMask,
    from: NodeId,
    message: &ArbiterMessage,
) -> Result<()> {
    let problem = if message.node != from {
        Some(format!("message from node {} claims sender {}", from, message.node))
    } else if message.gid != *gid {
        Some(format!("node {} answered for {} while gathering {}", from, message.gid, gid))
    } else if !phase.accepts(message.code) {
        Some(format!("node {} sent {} during {} of {}", from, message.code, phase, gid))
    } else if !remaining.contains(from) {
        Some(format!("unexpected answer from node {} for {}", from, gid))
    } else {
        None
    };

    match problem {
        Some(reason) => {
            tracing::error!("Protocol violation: {}", reason);
            Err(Error::ProtocolViolation(reason))
        }
        None => Ok(()),
    }
}

/// Resolve once shutdown is requested. A dropped sender never resolves.
pub(super) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
