mod endpoint;
mod log;
mod membership;
mod message;
mod snapshot;

pub use endpoint::RaftEndpoint;
pub use log::HardState;
pub use log::LogEntry;
pub use log::Operation;
pub use log::Ordered;
pub use membership::MembershipChangeMode;
pub use membership::RaftGroupMembers;
pub use membership::RaftGroupTerm;
pub use membership::UpdateGroupMembersOp;
pub use message::AppendEntriesFailureResponse;
pub use message::AppendEntriesRequest;
pub use message::AppendEntriesSuccessResponse;
pub use message::InstallSnapshotRequest;
pub use message::InstallSnapshotResponse;
pub use message::MessageKind;
pub use message::PreVoteRequest;
pub use message::PreVoteResponse;
pub use message::RaftMessage;
pub use message::TriggerLeaderElectionRequest;
pub use message::VoteRequest;
pub use message::VoteResponse;
pub use snapshot::SnapshotChunk;
pub use snapshot::SnapshotEntry;
