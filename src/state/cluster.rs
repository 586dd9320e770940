//! Cluster State
//!
//! Shared view of node membership, per-node status and the commit fencing
//! flag. Readers take the shared lock for a consistent snapshot; membership
//! and health collaborators mutate under the exclusive lock.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use super::{NodeId, NodeMask};
use crate::error::{Error, Result};

/// Node status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node takes part in commits
    Online,
    /// Node was excluded from commits and must recover before rejoining
    Disabled,
    /// Node is connected but not making progress
    Stalled,
    /// Node was stopped by an administrator
    Stopped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "ONLINE"),
            NodeStatus::Disabled => write!(f, "DISABLED"),
            NodeStatus::Stalled => write!(f, "STALLED"),
            NodeStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// State of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identity
    pub id: NodeId,
    /// Arbiter address (host:port)
    pub address: String,
    /// Current status
    pub status: NodeStatus,
    /// When the status last changed
    pub changed_at: chrono::DateTime<chrono::Utc>,
}

impl NodeState {
    /// Create a new node state. Nodes start disabled until recovered.
    pub fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address,
            status: NodeStatus::Disabled,
            changed_at: chrono::Utc::now(),
        }
    }
}

/// Consistent view of the fields the commit protocol reads together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSnapshot {
    /// This node's own status
    pub own_status: NodeStatus,
    /// Nodes whose status is not Online
    pub disabled: NodeMask,
    /// Every configured node
    pub all: NodeMask,
    /// Number of configured nodes
    pub node_count: usize,
}

impl ClusterSnapshot {
    /// Nodes expected to also commit a transaction started by `self_id`
    pub fn participants(&self, self_id: NodeId) -> NodeMask {
        self.all
            .difference(self.disabled)
            .difference(NodeMask::single(self_id))
    }
}

struct ClusterInner {
    nodes: BTreeMap<NodeId, NodeState>,
    disabled: NodeMask,
}

impl ClusterInner {
    fn all(&self) -> NodeMask {
        self.nodes.keys().copied().collect()
    }

    fn apply_status(&mut self, id: NodeId, status: NodeStatus) -> Result<NodeStatus> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let previous = node.status;
        if previous != status {
            node.status = status;
            node.changed_at = chrono::Utc::now();
        }
        if status == NodeStatus::Online {
            self.disabled.remove(id);
        } else {
            self.disabled.insert(id);
        }
        Ok(previous)
    }
}

/// Shared cluster state
pub struct ClusterState {
    /// This node's ID
    node_id: NodeId,
    /// Membership guarded by the cluster lock
    inner: RwLock<ClusterInner>,
    /// Bumped on every membership mutation
    changes: watch::Sender<u64>,
    /// Set while node recovery fences new commits
    commits_blocked: watch::Sender<bool>,
}

impl ClusterState {
    /// Create the cluster state from the configured node list
    pub fn new(node_id: NodeId, nodes: Vec<(NodeId, String)>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (id, address) in nodes {
            if !NodeMask::is_valid_id(id) {
                return Err(Error::Config(format!("node id {} out of range", id)));
            }
            if map.insert(id, NodeState::new(id, address)).is_some() {
                return Err(Error::Config(format!("duplicate node id {}", id)));
            }
        }
        if !map.contains_key(&node_id) {
            return Err(Error::NodeNotFound(node_id));
        }

        let inner = ClusterInner {
            disabled: map.keys().copied().collect(),
            nodes: map,
        };
        let (changes, _) = watch::channel(0);
        let (commits_blocked, _) = watch::channel(false);

        Ok(Self {
            node_id,
            inner: RwLock::new(inner),
            changes,
            commits_blocked,
        })
    }

    /// Create the cluster state from configuration
    pub fn from_config(config: &crate::config::CommitConfig) -> Result<Self> {
        let nodes = config
            .cluster
            .nodes
            .iter()
            .map(|n| (n.id, n.address.clone()))
            .collect();
        Self::new(config.node.id, nodes)
    }

    /// Get this node's ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Read own status, disabled mask and node count under one shared lock
    pub async fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.inner.read().await;
        ClusterSnapshot {
            own_status: inner
                .nodes
                .get(&self.node_id)
                .map(|n| n.status)
                .unwrap_or(NodeStatus::Disabled),
            disabled: inner.disabled,
            all: inner.all(),
            node_count: inner.nodes.len(),
        }
    }

    /// Get a node's status
    pub async fn node_status(&self, id: NodeId) -> Result<NodeStatus> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(&id)
            .map(|n| n.status)
            .ok_or(Error::NodeNotFound(id))
    }

    /// Get this node's own status
    pub async fn own_status(&self) -> NodeStatus {
        self.snapshot().await.own_status
    }

    /// Get the mask of nodes that are not Online
    pub async fn disabled_mask(&self) -> NodeMask {
        self.inner.read().await.disabled
    }

    /// Get a node's state
    pub async fn get_node(&self, id: NodeId) -> Option<NodeState> {
        self.inner.read().await.nodes.get(&id).cloned()
    }

    /// Get all nodes (including self)
    pub async fn all_nodes(&self) -> Vec<NodeState> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    /// Change a node's status from a membership or health collaborator.
    ///
    /// Going back to Online is refused here: only the fenced recovery path
    /// may re-enable a node. Returns the previous status.
    pub async fn set_status(&self, id: NodeId, status: NodeStatus) -> Result<NodeStatus> {
        let previous = {
            let mut inner = self.inner.write().await;
            let previous = inner
                .nodes
                .get(&id)
                .map(|n| n.status)
                .ok_or(Error::NodeNotFound(id))?;
            if status == NodeStatus::Online && previous != NodeStatus::Online {
                return Err(Error::IllegalStatusChange {
                    node: id,
                    from: previous,
                    to: status,
                });
            }
            inner.apply_status(id, status)?
        };

        if previous != status {
            tracing::info!("Node {} status {} -> {}", id, previous, status);
            self.changes.send_modify(|epoch| *epoch += 1);
        }
        Ok(previous)
    }

    /// Bring a node back Online. Callers must hold the commit barrier
    /// exclusively; see [`crate::commit::recovery::enable_node`].
    pub(crate) async fn mark_online(&self, id: NodeId) -> Result<NodeStatus> {
        let previous = self.inner.write().await.apply_status(id, NodeStatus::Online)?;
        if previous != NodeStatus::Online {
            tracing::info!("Node {} status {} -> {}", id, previous, NodeStatus::Online);
            self.changes.send_modify(|epoch| *epoch += 1);
        }
        Ok(previous)
    }

    /// Subscribe to membership changes
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Fence new commits (recovery is about to take the commit barrier)
    pub fn block_new_commits(&self) {
        self.commits_blocked.send_replace(true);
    }

    /// Fence new commits until the returned guard is dropped
    pub fn fence_new_commits(&self) -> CommitFence<'_> {
        self.block_new_commits();
        CommitFence { cluster: self }
    }

    /// Lift the commit fence
    pub fn unblock_new_commits(&self) {
        self.commits_blocked.send_replace(false);
    }

    /// Check whether new commits are currently fenced
    pub fn commits_blocked(&self) -> bool {
        *self.commits_blocked.borrow()
    }

    /// Wait until new commits are no longer fenced
    pub async fn wait_until_commits_unblocked(&self) -> Result<()> {
        let mut rx = self.commits_blocked.subscribe();
        rx.wait_for(|blocked| !*blocked)
            .await
            .map(|_| ())
            .map_err(|_| Error::ShuttingDown)
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let inner = self.inner.read().await;
        let mut summary = ClusterSummary {
            node_id: self.node_id,
            total_nodes: inner.nodes.len(),
            online_nodes: 0,
            disabled_nodes: 0,
            stalled_nodes: 0,
            stopped_nodes: 0,
            disabled_mask: inner.disabled.bits(),
            commits_blocked: self.commits_blocked(),
        };

        for node in inner.nodes.values() {
            match node.status {
                NodeStatus::Online => summary.online_nodes += 1,
                NodeStatus::Disabled => summary.disabled_nodes += 1,
                NodeStatus::Stalled => summary.stalled_nodes += 1,
                NodeStatus::Stopped => summary.stopped_nodes += 1,
            }
        }

        summary
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub node_id: NodeId,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub disabled_nodes: usize,
    pub stalled_nodes: usize,
    pub stopped_nodes: usize,
    pub disabled_mask: u64,
    pub commits_blocked: bool,
}

/// Keeps new commits fenced while alive
#[must_use = "the fence is lifted as soon as the guard is dropped"]
pub struct CommitFence<'a> {
    cluster: &'a ClusterState,
}

impl Drop for CommitFence<'_> {
    fn drop(&mut self) {
        self.cluster.unblock_new_commits();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Cluster of `count` nodes seen from node 1, every node Online
    pub(crate) async fn online_cluster(count: NodeId) -> ClusterState {
        let nodes = (1..=count)
            .map(|id| (id, format!("localhost:{}", 7700 + id)))
            .collect();
        let cluster = ClusterState::new(1, nodes).unwrap();
        for id in 1..=count {
            cluster.mark_online(id).await.unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn test_nodes_start_disabled() {
        let cluster = ClusterState::new(
            1,
            vec![(1, "localhost:7701".into()), (2, "localhost:7702".into())],
        )
        .unwrap();

        let snapshot = cluster.snapshot().await;
        assert_eq!(snapshot.own_status, NodeStatus::Disabled);
        assert_eq!(snapshot.disabled, NodeMask::first_n(2));
        assert_eq!(snapshot.node_count, 2);
    }

    #[tokio::test]
    async fn test_participants_exclude_self_and_disabled() {
        let cluster = online_cluster(3).await;
        assert_eq!(
            cluster.snapshot().await.participants(1),
            [2, 3].into_iter().collect()
        );

        cluster.set_status(3, NodeStatus::Disabled).await.unwrap();
        let snapshot = cluster.snapshot().await;
        assert_eq!(snapshot.participants(1), NodeMask::single(2));
        assert_eq!(snapshot.own_status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_disabled_mask_tracks_status() {
        let cluster = online_cluster(4).await;
        cluster.set_status(2, NodeStatus::Stalled).await.unwrap();
        cluster.set_status(4, NodeStatus::Stopped).await.unwrap();

        let disabled = cluster.disabled_mask().await;
        for node in cluster.all_nodes().await {
            assert_eq!(disabled.contains(node.id), node.status != NodeStatus::Online);
        }

        let summary = cluster.summary().await;
        assert_eq!(summary.online_nodes, 2);
        assert_eq!(summary.stalled_nodes, 1);
        assert_eq!(summary.stopped_nodes, 1);
    }

    #[tokio::test]
    async fn test_reenable_requires_recovery() {
        let cluster = online_cluster(2).await;
        cluster.set_status(2, NodeStatus::Disabled).await.unwrap();

        let err = cluster.set_status(2, NodeStatus::Online).await.unwrap_err();
        assert!(matches!(err, Error::IllegalStatusChange { node: 2, .. }));
        assert_eq!(cluster.node_status(2).await.unwrap(), NodeStatus::Disabled);
    }

    #[tokio::test]
    async fn test_change_notification() {
        let cluster = online_cluster(2).await;
        let mut changes = cluster.subscribe_changes();

        cluster.set_status(2, NodeStatus::Disabled).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .unwrap()
            .unwrap();

        // Same status again is not a change
        cluster.set_status(2, NodeStatus::Disabled).await.unwrap();
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_wait_until_commits_unblocked() {
        let cluster = std::sync::Arc::new(online_cluster(2).await);
        cluster.block_new_commits();

        let waiter = {
            let cluster = std::sync::Arc::clone(&cluster);
            tokio::spawn(async move { cluster.wait_until_commits_unblocked().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cluster.unblock_new_commits();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_rejects_bad_membership() {
        assert!(ClusterState::new(1, vec![(2, "a".into())]).is_err());
        assert!(ClusterState::new(1, vec![(1, "a".into()), (1, "b".into())]).is_err());
        assert!(ClusterState::new(65, vec![(65, "a".into())]).is_err());
    }
}
