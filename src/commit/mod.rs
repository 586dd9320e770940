//! Commit Module
//!
//! Three-phase commit of distributed transactions: the arbiter message
//! vocabulary, the per-transaction state machine, the quorum gatherer, the
//! commit barrier and the recovery entry points.

mod barrier;
mod coordinator;
mod gather;
mod message;
pub mod recovery;
mod transaction;

pub use barrier::{CommitBarrier, ExclusiveBarrierGuard, SharedBarrierGuard};
pub use coordinator::{CommitCoordinator, CommitOutcome};
pub use gather::{GatherOutcome, GatherPhase, QuorumGatherer};
pub use message::{ArbiterMessage, Gid, LocalXid, MessageCode};
pub use recovery::{enable_node, resolve_in_doubt, RecoveryReport};
pub use transaction::{CommitState, Transaction};
