//! mmcommit Error Types

use thiserror::Error;

use crate::commit::CommitState;
use crate::state::{NodeId, NodeStatus};

/// Result type alias for mmcommit operations
pub type Result<T> = std::result::Result<T, Error>;

/// mmcommit error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Durable log errors
    #[error("Transaction log error: {0}")]
    Log(String),

    #[error("Transaction log storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Commit protocol errors
    #[error("Failed to prepare transaction {gid} locally: {reason}")]
    LocalPrepareFailed { gid: String, reason: String },

    #[error("Failed to prepare transaction {gid} at node {node}")]
    PeerAborted { gid: String, node: NodeId },

    #[error("Our node was disabled during commit of {gid} (state {state})")]
    SelfDisabled { gid: String, state: CommitState },

    #[error("Multimaster node is not online: current status {0}")]
    NodeNotOnline(NodeStatus),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Quorum not reached: {reached}/{required}")]
    QuorumNotReached { reached: usize, required: usize },

    #[error("Invalid commit state transition {from} -> {to}")]
    InvalidTransition { from: CommitState, to: CommitState },

    // Membership errors
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {node} cannot go from {from} to {to} outside recovery")]
    IllegalStatusChange {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    // Channel and network errors
    #[error("Message channel error: {0}")]
    Channel(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the caller may restart the whole transaction after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NodeNotOnline(_)
                | Error::PeerAborted { .. }
                | Error::LocalPrepareFailed { .. }
                | Error::QuorumNotReached { .. }
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
        )
    }

    /// Check if this error means the local view of the cluster can no longer
    /// be trusted for the in-flight transaction.
    ///
    /// [`crate::commit::CommitCoordinator::commit`] disables its own node on
    /// such an error, so no further commit starts until the node is enabled
    /// again through recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SelfDisabled { .. } | Error::ProtocolViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let abort = Error::PeerAborted { gid: "MTM-1-42".into(), node: 2 };
        assert!(abort.is_retryable());
        assert!(!abort.is_fatal());
        assert_eq!(abort.to_string(), "Failed to prepare transaction MTM-1-42 at node 2");

        let disabled = Error::SelfDisabled {
            gid: "MTM-1-42".into(),
            state: CommitState::Prepared,
        };
        assert!(disabled.is_fatal());
        assert!(!disabled.is_retryable());

        assert!(Error::ProtocolViolation("bad code".into()).is_fatal());
        assert!(Error::NodeNotOnline(NodeStatus::Disabled).is_retryable());
    }
}
