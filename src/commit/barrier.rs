//! Commit Barrier
//!
//! Held shared by every transaction for the whole of its commit protocol and
//! exclusively, for a moment, by node recovery. Once recovery has held it
//! exclusively, every commit that reaches precommit computed its participants
//! after the recovered node was enabled.

use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Guard held by a committing transaction
pub type SharedBarrierGuard = OwnedRwLockReadGuard<()>;

/// Guard held by node recovery
pub type ExclusiveBarrierGuard = OwnedRwLockWriteGuard<()>;

/// Cluster-wide commit barrier
#[derive(Clone, Default)]
pub struct CommitBarrier {
    lock: Arc<RwLock<()>>,
}

impl CommitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the barrier as a committing transaction
    pub async fn shared(&self) -> SharedBarrierGuard {
        Arc::clone(&self.lock).read_owned().await
    }

    /// Wait for in-flight commits to drain and hold off new ones
    pub async fn exclusive(&self) -> ExclusiveBarrierGuard {
        Arc::clone(&self.lock).write_owned().await
    }

    /// Try to enter as a committing transaction without waiting
    pub fn try_shared(&self) -> Option<SharedBarrierGuard> {
        Arc::clone(&self.lock).try_read_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_commits_share_the_barrier() {
        let barrier = CommitBarrier::new();
        let _a = barrier.shared().await;
        let _b = barrier.shared().await;
        assert!(barrier.try_shared().is_some());
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_inflight_commits() {
        let barrier = CommitBarrier::new();
        let inflight = barrier.shared().await;

        let recovery = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let _guard = barrier.exclusive().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!recovery.is_finished());

        drop(inflight);
        tokio::time::timeout(Duration::from_secs(1), recovery)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_blocks_new_commits() {
        let barrier = CommitBarrier::new();
        let guard = barrier.exclusive().await;
        assert!(barrier.try_shared().is_none());
        drop(guard);
        assert!(barrier.try_shared().is_some());
    }
}
