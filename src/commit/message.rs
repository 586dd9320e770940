//! Arbiter Messages
//!
//! The acknowledgements exchanged while committing a transaction, and the
//! global transaction identifier they refer to.

use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::NodeId;

/// Local transaction identifier, unique on its origin node
pub type LocalXid = u64;

/// Global transaction identifier
///
/// Rendered as `MTM-<origin>-<xid>`. The origin node is recoverable from the
/// gid so that participants know where to send their acknowledgements and
/// recovery can tell which transactions this node coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Gid {
    origin: NodeId,
    xid: LocalXid,
}

impl Gid {
    const PREFIX: &'static str = "MTM-";

    pub fn new(origin: NodeId, xid: LocalXid) -> Self {
        Self { origin, xid }
    }

    /// Node that coordinates this transaction
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Local transaction id on the origin node
    pub fn xid(&self) -> LocalXid {
        self.xid
    }

    /// Name of the per-transaction message stream
    pub fn stream_name(&self) -> String {
        format!("xid{}@{}", self.xid, self.origin)
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}-{}", Self::PREFIX, self.origin, self.xid)
    }
}

impl FromStr for Gid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::ProtocolViolation(format!("malformed gid '{}'", s));

        let rest = s.strip_prefix(Self::PREFIX).ok_or_else(invalid)?;
        let (origin, xid) = rest.split_once('-').ok_or_else(invalid)?;
        let origin: NodeId = origin.parse().map_err(|_| invalid())?;
        let xid: LocalXid = xid.parse().map_err(|_| invalid())?;
        if origin == 0 {
            return Err(invalid());
        }
        Ok(Self { origin, xid })
    }
}

impl From<Gid> for String {
    fn from(gid: Gid) -> Self {
        gid.to_string()
    }
}

impl TryFrom<String> for Gid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Acknowledgement code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageCode {
    Prepared = 1,
    Aborted = 2,
    Precommitted = 3,
    Committed = 4,
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageCode::Prepared),
            2 => Ok(MessageCode::Aborted),
            3 => Ok(MessageCode::Precommitted),
            4 => Ok(MessageCode::Committed),
            other => Err(Error::ProtocolViolation(format!("unknown message code {}", other))),
        }
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageCode::Prepared => write!(f, "PREPARED"),
            MessageCode::Aborted => write!(f, "ABORTED"),
            MessageCode::Precommitted => write!(f, "PRECOMMITTED"),
            MessageCode::Committed => write!(f, "COMMITTED"),
        }
    }
}

/// Commit coordination message. Carries no transaction content: the
/// changes themselves reach replicas through the replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterMessage {
    /// Transaction the acknowledgement refers to
    pub gid: Gid,
    /// Sending node
    pub node: NodeId,
    /// Acknowledgement code
    pub code: MessageCode,
}

impl ArbiterMessage {
    pub fn new(gid: Gid, node: NodeId, code: MessageCode) -> Self {
        Self { gid, node, code }
    }

    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
