//! Transaction Context
//!
//! The explicit per-transaction value threaded through every coordinator
//! operation, and the commit state machine it moves through.

use serde::{Deserialize, Serialize};

use super::message::{Gid, LocalXid};
use crate::error::{Error, Result};
use crate::state::{NodeId, NodeMask};

/// Three-phase commit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    /// Not yet committing
    Idle,
    /// Local prepare in progress
    Preparing,
    /// Prepared locally, gathering prepare acknowledgements
    Prepared,
    /// Precommit being recorded and acknowledged
    Precommitting,
    /// Every reachable participant precommitted
    Precommitted,
    /// Local commit and commit acknowledgements in progress
    Committing,
    /// Terminal: committed
    Committed,
    /// Terminal: aborted
    Aborted,
}

impl CommitState {
    /// Check whether the state machine allows `self -> next`
    pub fn can_advance_to(self, next: CommitState) -> bool {
        use CommitState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Precommitting)
                | (Precommitting, Precommitted)
                | (Precommitted, Committing)
                | (Committing, Committed)
                | (Preparing, Aborted)
                | (Prepared, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommitState::Committed | CommitState::Aborted)
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitState::Idle => write!(f, "IDLE"),
            CommitState::Preparing => write!(f, "PREPARING"),
            CommitState::Prepared => write!(f, "PREPARED"),
            CommitState::Precommitting => write!(f, "PRECOMMITTING"),
            CommitState::Precommitted => write!(f, "PRECOMMITTED"),
            CommitState::Committing => write!(f, "COMMITTING"),
            CommitState::Committed => write!(f, "COMMITTED"),
            CommitState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A transaction as seen by the commit coordinator
#[derive(Debug, Clone)]
pub struct Transaction {
    xid: LocalXid,
    gid: Gid,
    is_distributed: bool,
    contains_writes: bool,
    participants: NodeMask,
    state: CommitState,
}

impl Transaction {
    /// Start tracking a transaction originated by `node_id`
    pub fn new(node_id: NodeId, xid: LocalXid, is_distributed: bool) -> Self {
        Self {
            xid,
            gid: Gid::new(node_id, xid),
            is_distributed,
            contains_writes: false,
            participants: NodeMask::EMPTY,
            state: CommitState::Idle,
        }
    }

    pub fn xid(&self) -> LocalXid {
        self.xid
    }

    pub fn gid(&self) -> &Gid {
        &self.gid
    }

    pub fn is_distributed(&self) -> bool {
        self.is_distributed
    }

    pub fn contains_writes(&self) -> bool {
        self.contains_writes
    }

    /// Record that the transaction performed a replicable write
    pub fn mark_write(&mut self) {
        self.contains_writes = true;
    }

    /// Participant mask computed at commit start
    pub fn participants(&self) -> NodeMask {
        self.participants
    }

    pub(crate) fn set_participants(&mut self, participants: NodeMask) {
        self.participants = participants;
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    /// Whether the transaction has to go through three-phase commit
    pub fn needs_coordination(&self) -> bool {
        self.is_distributed && self.contains_writes
    }

    /// Move to the next commit state
    pub(crate) fn advance(&mut self, next: CommitState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("{}: {} -> {}", self.gid, self.state, next);
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut tx = Transaction::new(1, 42, true);
        for next in [
            CommitState::Preparing,
            CommitState::Prepared,
            CommitState::Precommitting,
            CommitState::Precommitted,
            CommitState::Committing,
            CommitState::Committed,
        ] {
            tx.advance(next).unwrap();
        }
        assert!(tx.state().is_terminal());
    }

    #[test]
    fn test_abort_only_before_precommit() {
        assert!(CommitState::Preparing.can_advance_to(CommitState::Aborted));
        assert!(CommitState::Prepared.can_advance_to(CommitState::Aborted));
        assert!(!CommitState::Precommitting.can_advance_to(CommitState::Aborted));
        assert!(!CommitState::Precommitted.can_advance_to(CommitState::Aborted));
        assert!(!CommitState::Committing.can_advance_to(CommitState::Aborted));

        let mut tx = Transaction::new(1, 7, true);
        let err = tx.advance(CommitState::Committed).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(tx.state(), CommitState::Idle);
    }

    #[test]
    fn test_needs_coordination() {
        let mut tx = Transaction::new(2, 9, true);
        assert!(!tx.needs_coordination());
        tx.mark_write();
        assert!(tx.needs_coordination());
        assert_eq!(tx.gid().to_string(), "MTM-2-9");

        let mut local = Transaction::new(2, 10, false);
        local.mark_write();
        assert!(!local.needs_coordination());
    }
}
