//! Peer Monitor
//!
//! Turns peer link events into node status changes. A peer whose link goes
//! down is disabled at once. A peer whose link comes up is enabled through
//! the fenced recovery path on a task of its own, since that waits for every
//! in-flight commit and those may be waiting for a disconnect to be applied.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::PeerEvent;
use crate::commit::{recovery, CommitBarrier};
use crate::error::Result;
use crate::state::{ClusterState, NodeId, NodeMask, NodeStatus};

#[derive(Default)]
struct Links {
    /// Peers whose link is up
    connected: NodeMask,
    /// Peers with an enable task running
    enabling: NodeMask,
}

/// Applies [`PeerEvent`]s to cluster state
pub struct PeerMonitor {
    cluster: Arc<ClusterState>,
    barrier: CommitBarrier,
    links: Arc<Mutex<Links>>,
}

impl PeerMonitor {
    pub fn new(cluster: Arc<ClusterState>, barrier: CommitBarrier) -> Self {
        Self {
            cluster,
            barrier,
            links: Arc::new(Mutex::new(Links::default())),
        }
    }

    /// Run the monitor on its own task
    pub fn spawn(self, events: mpsc::Receiver<PeerEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Apply events until the sender side is gone
    pub async fn run(self, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Connected(node) => self.on_connected(node),
                PeerEvent::Disconnected(node) => {
                    if let Err(e) = self.on_disconnected(node).await {
                        tracing::warn!("Failed to disable node {}: {}", node, e);
                    }
                }
            }
        }
        tracing::debug!("Peer monitor stopped");
    }

    fn on_connected(&self, node: NodeId) {
        {
            let mut links = lock(&self.links);
            links.connected.insert(node);
            if links.enabling.contains(node) {
                return;
            }
            links.enabling.insert(node);
        }

        let cluster = Arc::clone(&self.cluster);
        let barrier = self.barrier.clone();
        let links = Arc::clone(&self.links);
        tokio::spawn(async move {
            let result = enable_peer(&cluster, &barrier, node).await;

            let connected = {
                let mut links = lock(&links);
                links.enabling.remove(node);
                links.connected.contains(node)
            };

            if let Err(e) = result {
                tracing::warn!("Failed to enable node {}: {}", node, e);
                return;
            }
            // Link dropped while the enable waited for the barrier
            if !connected {
                if let Err(e) = cluster.set_status(node, NodeStatus::Disabled).await {
                    tracing::warn!("Failed to disable node {}: {}", node, e);
                }
            }
        });
    }

    async fn on_disconnected(&self, node: NodeId) -> Result<()> {
        lock(&self.links).connected.remove(node);
        self.cluster.set_status(node, NodeStatus::Disabled).await?;
        Ok(())
    }
}

async fn enable_peer(cluster: &ClusterState, barrier: &CommitBarrier, node: NodeId) -> Result<()> {
    if cluster.node_status(node).await? == NodeStatus::Online {
        return Ok(());
    }
    recovery::enable_node(cluster, barrier, node).await?;
    Ok(())
}

fn lock(links: &Mutex<Links>) -> MutexGuard<'_, Links> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::watch;
    use crate::channel::MessageHub;
    use crate::commit::{ArbiterMessage, CommitCoordinator, CommitOutcome, MessageCode};
    use crate::config::CommitSettings;
    use crate::txlog::{DurableLog, PreparedState, SqliteLog};

    /// Nodes 1..=4 seen from node 1, with `online` of them Online
    async fn cluster(online: &[NodeId]) -> Arc<ClusterState> {
        let nodes = (1..=4).map(|id| (id, format!("localhost:{}", 7700 + id))).collect();
        let cluster = ClusterState::new(1, nodes).unwrap();
        for &id in online {
            cluster.mark_online(id).await.unwrap();
        }
        Arc::new(cluster)
    }

    macro_rules! eventually {
        ($cond:expr) => {
            tokio::time::timeout(Duration::from_secs(2), async {
                while !$cond {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap()
        };
    }

    #[tokio::test]
    async fn test_disconnect_is_applied_while_enable_waits() {
        let cluster = cluster(&[1, 2, 3]).await;
        let barrier = CommitBarrier::new();
        let hub = MessageHub::new(1);
        hub.attach(2);
        hub.attach(3);
        let log = Arc::new(SqliteLog::in_memory().unwrap());
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = Arc::new(CommitCoordinator::new(
            cluster.clone(),
            barrier.clone(),
            log.clone(),
            hub.clone(),
            CommitSettings::default(),
            shutdown_rx,
        ));

        let (events, rx) = mpsc::channel(16);
        PeerMonitor::new(cluster.clone(), barrier.clone()).spawn(rx);

        let mut tx = coordinator.begin_transaction(60, true).await.unwrap();
        tx.mark_write();
        let gid = *tx.gid();
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.commit(&mut tx).await })
        };

        eventually!(hub.is_subscribed(&gid.stream_name()));
        for node in [2, 3] {
            hub.deliver(node, ArbiterMessage::new(gid, node, MessageCode::Prepared));
        }
        eventually!(log.outcome(&gid).await.unwrap() == Some(PreparedState::Precommitted));

        // Node 4 shows up while the commit holds the barrier
        events.send(PeerEvent::Connected(4)).await.unwrap();
        eventually!(cluster.commits_blocked());

        // Node 3 goes away; the commit can only finish once it is disabled
        hub.detach(3);
        events.send(PeerEvent::Disconnected(3)).await.unwrap();
        hub.deliver(2, ArbiterMessage::new(gid, 2, MessageCode::Precommitted));
        hub.deliver(2, ArbiterMessage::new(gid, 2, MessageCode::Committed));

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                participants: NodeMask::single(2),
                dropped: NodeMask::single(3),
            }
        );

        eventually!(cluster.node_status(4).await.unwrap() == NodeStatus::Online);
        eventually!(!cluster.commits_blocked());
        assert_eq!(cluster.node_status(3).await.unwrap(), NodeStatus::Disabled);
    }

    #[tokio::test]
    async fn test_link_lost_during_enable_ends_disabled() {
        let cluster = cluster(&[1]).await;
        let barrier = CommitBarrier::new();
        let monitor = PeerMonitor::new(cluster.clone(), barrier.clone());
        let links = Arc::clone(&monitor.links);
        let (events, rx) = mpsc::channel(16);
        monitor.spawn(rx);

        let inflight = barrier.shared().await;
        events.send(PeerEvent::Connected(2)).await.unwrap();
        eventually!(cluster.commits_blocked());
        events.send(PeerEvent::Disconnected(2)).await.unwrap();
        eventually!(!lock(&links).connected.contains(2));

        drop(inflight);
        eventually!(!cluster.commits_blocked() && !lock(&links).enabling.contains(2));
        eventually!(cluster.node_status(2).await.unwrap() == NodeStatus::Disabled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cluster.node_status(2).await.unwrap(), NodeStatus::Disabled);
    }

    #[tokio::test]
    async fn test_connect_enables_peer() {
        let cluster = cluster(&[1]).await;
        let (events, rx) = mpsc::channel(16);
        PeerMonitor::new(cluster.clone(), CommitBarrier::new()).spawn(rx);

        events.send(PeerEvent::Connected(3)).await.unwrap();
        eventually!(cluster.node_status(3).await.unwrap() == NodeStatus::Online);

        events.send(PeerEvent::Disconnected(3)).await.unwrap();
        eventually!(cluster.node_status(3).await.unwrap() == NodeStatus::Disabled);
        assert!(!cluster.commits_blocked());
    }
}
