use serde::Deserialize;
use serde::Serialize;

use crate::model::RaftEndpoint;
use crate::model::UpdateGroupMembersOp;

/// A single replicated log entry. Immutable once appended; entries are
/// contiguous by index and a committed entry is never altered or removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub operation: Operation,
}

/// Payload of a log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// An opaque user command applied to the attached state machine.
    Command(Vec<u8>),
    /// A single-change group reconfiguration.
    UpdateGroupMembers(UpdateGroupMembersOp),
    /// Terminates the whole group once committed.
    TerminateGroup,
}

impl Operation {
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Operation::UpdateGroupMembers(_))
    }

    pub fn is_terminate_group(&self) -> bool {
        matches!(self, Operation::TerminateGroup)
    }
}

/// Term and vote bookkeeping persisted through the Log Store before any
/// vote response or append success leaves the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<RaftEndpoint>,
}

/// A client-visible result tied to the exact commit index that produced it,
/// enabling strict ordering checks by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ordered<T> {
    pub commit_index: u64,
    pub value: T,
}

impl<T> Ordered<T> {
    pub fn new(commit_index: u64, value: T) -> Self {
        Self {
            commit_index,
            value,
        }
    }
}
