//! mmcommit - Three-Phase Commit Coordinator for Multi-Master Replicated Stores
//!
//! Coordinates atomic commit of a transaction across the replica nodes of a
//! multi-master store: either every reachable node durably applies the
//! transaction or none does, even when nodes disconnect mid-commit.
//!
//! # Architecture
//!
//! Each distributed transaction with writes is driven through prepare,
//! precommit and commit by the [`commit::CommitCoordinator`]. At every phase
//! the coordinator waits for one acknowledgement per participant; a node that
//! disconnects is dropped only once cluster state confirms it is no longer
//! online. A commit barrier keeps commit decisions consistent with node
//! recovery.
//!
//! # Features
//!
//! - Participant computation from one consistent cluster snapshot
//! - Disconnect-tolerant quorum gathering without polling
//! - SQLite-backed durable transaction log with in-doubt recovery
//! - TCP arbiter transport with CRC32-checked frames
//! - HTTP API for status and node administration

pub mod api;
pub mod channel;
pub mod commit;
pub mod config;
pub mod error;
pub mod network;
pub mod participant;
pub mod state;
pub mod txlog;

pub use config::CommitConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::channel::{MessageChannel, MessageHub, Subscription};
    pub use crate::commit::{
        ArbiterMessage, CommitBarrier, CommitCoordinator, CommitOutcome, CommitState, Gid,
        MessageCode, Transaction,
    };
    pub use crate::config::CommitConfig;
    pub use crate::error::{Error, Result};
    pub use crate::participant::{ArbiterSender, Participant};
    pub use crate::state::{ClusterState, NodeId, NodeMask, NodeStatus};
    pub use crate::txlog::{DurableLog, SqliteLog};
}
