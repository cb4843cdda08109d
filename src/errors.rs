//! Error hierarchy of the consensus engine.
//!
//! Caller-facing failures (`RaftError`) are kept separate from collaborator
//! faults (`StorageError`). Protocol-level rejections such as stale terms or
//! log mismatches never surface here: they are resolved internally by
//! stepping down or repairing the log.

use config::ConfigError;

use crate::model::RaftEndpoint;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, RaftError>;

/// Failures surfaced to clients of a
/// [`RaftNode`](crate::node::RaftNode).
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The node is not the group leader. Callers should redirect to the
    /// reported leader endpoint, if any, and retry.
    #[error("not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<RaftEndpoint> },

    /// The operation cannot be accepted right now: the uncommitted section
    /// of the log is full, or a membership change is already in progress.
    /// Safe to retry later.
    #[error("cannot replicate: {reason}")]
    CannotReplicate { reason: String },

    /// The outcome of a submitted operation is unknown: leadership changed
    /// before a commit or an abort was observed. Callers must not assume
    /// success or failure, and must not blindly retry non-idempotent
    /// operations.
    #[error("operation outcome is indeterminate after leadership change")]
    IndeterminateState,

    /// Optimistic concurrency guard of `change_membership`: the caller's
    /// expected membership commit index is stale.
    #[error("expected group members commit index {expected} but the committed one is {actual}")]
    MismatchingGroupMembersCommitIndex { expected: u64, actual: u64 },

    /// The requested membership change is not applicable, e.g. adding an
    /// endpoint that is already a member.
    #[error("invalid membership change: {0}")]
    InvalidMembershipChange(String),

    /// The requested leadership transfer cannot be performed.
    #[error("cannot transfer leadership: {0}")]
    LeadershipTransfer(String),

    /// A log entry violates the contiguity invariant of the Raft log.
    #[error("invalid log index {index}: {reason}")]
    InvalidLogIndex { index: u64, reason: String },

    /// The node has been terminated and no longer accepts operations.
    #[error("raft node terminated")]
    Terminated,

    /// Configuration validation or loading failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A Log Store or State Machine fault. The node cannot safely continue
    /// and transitions to the terminated state.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An invariant breach the node cannot recover from, e.g. a truncation
    /// below the commit index. The node halts rather than risk diverging
    /// from the group.
    #[error("fatal consensus fault: {0}")]
    Fatal(String),
}

/// Faults reported by the pluggable Log Store and State Machine
/// collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization failures for persisted data.
    #[error(transparent)]
    Codec(#[from] bincode::Error),

    #[error("log store failure: {0}")]
    LogStore(String),

    #[error("state machine failure: {0}")]
    StateMachine(String),

    #[error("snapshot operation failed: {0}")]
    Snapshot(String),
}

impl RaftError {
    /// Whether the error leaves the group state unknown for the submitted
    /// operation.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, RaftError::IndeterminateState)
    }

    /// Whether the caller may safely retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::CannotReplicate { .. }
        )
    }
}
