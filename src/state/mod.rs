//! State Management Module
//!
//! Cluster membership, per-node status and node sets.

mod cluster;
mod nodemask;

pub use cluster::{ClusterState, ClusterSnapshot, ClusterSummary, CommitFence, NodeState, NodeStatus};
pub use nodemask::{NodeMask, NodeMaskIter, MAX_NODES};

/// Node identity, stable for the lifetime of the cluster (1..=64)
pub type NodeId = u32;

#[cfg(test)]
pub(crate) use cluster::tests::online_cluster;
