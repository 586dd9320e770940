//! Recovery
//!
//! Startup resolution of in-doubt transactions, and the fenced path that
//! brings a recovered node back Online.

use serde::Serialize;

use super::barrier::CommitBarrier;
use super::message::Gid;
use crate::error::Result;
use crate::state::{ClusterState, NodeId, NodeStatus};
use crate::txlog::{DurableLog, PreparedState};

/// What [`resolve_in_doubt`] did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Precommitted transactions that were committed
    pub committed: Vec<Gid>,
    /// Own prepared transactions that were aborted
    pub aborted: Vec<Gid>,
    /// Prepared transactions waiting for their origin's decision
    pub pending: Vec<Gid>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.aborted.is_empty() && self.pending.is_empty()
    }
}

/// Resolve every transaction the log left in doubt.
///
/// A precommitted transaction can only commit. A merely prepared one that
/// this node originated never reached precommit anywhere, so it is aborted.
/// Prepared transactions of other origins stay until their origin decides.
pub async fn resolve_in_doubt(node_id: NodeId, log: &dyn DurableLog) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for record in log.in_doubt().await? {
        match record.state {
            PreparedState::Precommitted => {
                log.commit_prepared(&record.gid).await?;
                tracing::info!("Recovery: committed precommitted transaction {}", record.gid);
                report.committed.push(record.gid);
            }
            PreparedState::Prepared if record.gid.origin() == node_id => {
                log.abort_prepared(&record.gid).await?;
                tracing::info!("Recovery: aborted own prepared transaction {}", record.gid);
                report.aborted.push(record.gid);
            }
            PreparedState::Prepared => {
                tracing::debug!(
                    "Recovery: {} waits for node {} to decide",
                    record.gid,
                    record.gid.origin()
                );
                report.pending.push(record.gid);
            }
            PreparedState::Committed | PreparedState::Aborted => {}
        }
    }

    Ok(report)
}

/// Bring `node` back Online.
///
/// New commits are fenced, in-flight ones drain out of the barrier, the node
/// is enabled, then the fence is lifted. Every commit that computes its
/// participants afterwards includes the node. Returns the previous status.
pub async fn enable_node(
    cluster: &ClusterState,
    barrier: &CommitBarrier,
    node: NodeId,
) -> Result<NodeStatus> {
    tracing::info!("Enabling node {}: blocking new commits", node);
    let fence = cluster.fence_new_commits();

    let result = {
        let _exclusive = barrier.exclusive().await;
        cluster.mark_online(node).await
    };

    drop(fence);
    if result.is_ok() {
        tracing::info!("Node {} enabled", node);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::txlog::SqliteLog;

    #[tokio::test]
    async fn test_resolve_in_doubt() {
        let log = SqliteLog::in_memory().unwrap();
        let precommitted = Gid::new(2, 1);
        let own_prepared = Gid::new(1, 2);
        let foreign_prepared = Gid::new(3, 3);
        let done = Gid::new(1, 4);

        for gid in [precommitted, own_prepared, foreign_prepared, done] {
            log.prepare(&gid).await.unwrap();
        }
        log.precommit(&precommitted).await.unwrap();
        log.commit_prepared(&done).await.unwrap();

        let report = resolve_in_doubt(1, &log).await.unwrap();
        assert_eq!(report.committed, vec![precommitted]);
        assert_eq!(report.aborted, vec![own_prepared]);
        assert_eq!(report.pending, vec![foreign_prepared]);

        assert_eq!(log.outcome(&precommitted).await.unwrap(), Some(PreparedState::Committed));
        assert_eq!(log.outcome(&own_prepared).await.unwrap(), Some(PreparedState::Aborted));
        assert_eq!(log.in_doubt().await.unwrap().len(), 1);

        // Nothing left to do on a second pass but the foreign transaction
        let again = resolve_in_doubt(1, &log).await.unwrap();
        assert!(again.committed.is_empty() && again.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_crash_after_precommit_recovers_to_committed() {
        let dir = tempfile::tempdir().unwrap();
        let gid = Gid::new(1, 42);
        {
            let log = SqliteLog::open(dir.path()).unwrap();
            log.prepare(&gid).await.unwrap();
            log.precommit(&gid).await.unwrap();
        }

        let log = SqliteLog::open(dir.path()).unwrap();
        let report = resolve_in_doubt(1, &log).await.unwrap();
        assert_eq!(report.committed, vec![gid]);
        assert_eq!(log.outcome(&gid).await.unwrap(), Some(PreparedState::Committed));
    }

    #[tokio::test]
    async fn test_enable_node_waits_for_inflight_commits() {
        let cluster = std::sync::Arc::new(
            ClusterState::new(1, vec![(1, "a:1".into()), (2, "b:1".into())]).unwrap(),
        );
        let barrier = CommitBarrier::new();
        let inflight = barrier.shared().await;

        let task = {
            let cluster = cluster.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move { enable_node(&cluster, &barrier, 2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cluster.commits_blocked());
        assert_eq!(cluster.node_status(2).await.unwrap(), NodeStatus::Disabled);

        drop(inflight);
        let previous = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(previous, NodeStatus::Disabled);
        assert_eq!(cluster.node_status(2).await.unwrap(), NodeStatus::Online);
        assert!(!cluster.commits_blocked());
    }

    #[tokio::test]
    async fn test_cancelled_enable_lifts_fence() {
        let cluster = std::sync::Arc::new(
            ClusterState::new(1, vec![(1, "a:1".into()), (2, "b:1".into())]).unwrap(),
        );
        let barrier = CommitBarrier::new();
        let _inflight = barrier.shared().await;

        let task = {
            let cluster = cluster.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move { enable_node(&cluster, &barrier, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cluster.commits_blocked());

        // Dropped while waiting for the barrier
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!cluster.commits_blocked());
        assert_eq!(cluster.node_status(2).await.unwrap(), NodeStatus::Disabled);
    }

    #[tokio::test]
    async fn test_enable_unknown_node_lifts_fence() {
        let cluster = ClusterState::new(1, vec![(1, "a:1".into())]).unwrap();
        let barrier = CommitBarrier::new();

        assert!(enable_node(&cluster, &barrier, 9).await.is_err());
        assert!(!cluster.commits_blocked());
    }
}
