//! Durable Transaction Log Module
//!
//! The local log primitives the commit coordinator drives. The log owns the
//! prepared transactions; the coordinator only tells it what to do with them.

mod sqlite;

pub use sqlite::SqliteLog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::commit::Gid;
use crate::error::Result;

/// Durable state of a prepared transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreparedState {
    /// Prepared, outcome not decided
    Prepared,
    /// Precommit recorded: the transaction can only commit
    Precommitted,
    /// Committed
    Committed,
    /// Aborted
    Aborted,
}

impl PreparedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreparedState::Prepared => "prepared",
            PreparedState::Precommitted => "precommitted",
            PreparedState::Committed => "committed",
            PreparedState::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepared" => Some(PreparedState::Prepared),
            "precommitted" => Some(PreparedState::Precommitted),
            "committed" => Some(PreparedState::Committed),
            "aborted" => Some(PreparedState::Aborted),
            _ => None,
        }
    }

    /// Whether the outcome is still open
    pub fn is_in_doubt(&self) -> bool {
        matches!(self, PreparedState::Prepared | PreparedState::Precommitted)
    }
}

impl std::fmt::Display for PreparedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction known to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedRecord {
    pub gid: Gid,
    pub state: PreparedState,
}

/// Local durable log primitives
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Durably prepare a transaction. An error means the log refused.
    async fn prepare(&self, gid: &Gid) -> Result<()>;

    /// Record that the transaction passed the point of no return
    async fn precommit(&self, gid: &Gid) -> Result<()>;

    /// Commit a prepared or precommitted transaction
    async fn commit_prepared(&self, gid: &Gid) -> Result<()>;

    /// Abort a prepared transaction. Refused once precommitted.
    async fn abort_prepared(&self, gid: &Gid) -> Result<()>;

    /// Transactions whose outcome is still open
    async fn in_doubt(&self) -> Result<Vec<PreparedRecord>>;

    /// Current state of a transaction, if the log knows it
    async fn outcome(&self, gid: &Gid) -> Result<Option<PreparedState>>;
}
