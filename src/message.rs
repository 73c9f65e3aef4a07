use crate::ring::Member;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-node monotonic transaction identifier.
pub type TxnId = u64;

/// Which slot of the replica set a write was addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Tertiary,
}

impl ReplicaRole {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(ReplicaRole::Primary),
            1 => Some(ReplicaRole::Secondary),
            2 => Some(ReplicaRole::Tertiary),
            _ => None,
        }
    }
}

/// The four client-visible operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Create => "create",
            Op::Read => "read",
            Op::Update => "update",
            Op::Delete => "delete",
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageKind {
    // coordinator -> replica
    Create {
        key: String,
        value: String,
        role: Option<ReplicaRole>,
    },
    Read {
        key: String,
    },
    Update {
        key: String,
        value: String,
        role: Option<ReplicaRole>,
    },
    Delete {
        key: String,
    },
    // replica -> coordinator
    Reply {
        success: bool,
    },
    // a `None` value is a miss, not a partial success
    ReadReply {
        value: Option<String>,
    },
}

/// The wire unit. Constructed, sent, and discarded; carries no state beyond
/// the call that creates it. `txn: None` marks re-replication traffic that
/// no coordinator is tracking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub txn: Option<TxnId>,
    pub from: Member,
    pub kind: MessageKind,
}
