//! The transport-agnostic wire protocol: a closed set of tagged message
//! variants, one immutable value per request/response kind. Every request
//! carries the group id, the sender endpoint and the sender's term.

use serde::Deserialize;
use serde::Serialize;

use crate::model::LogEntry;
use crate::model::RaftEndpoint;
use crate::model::RaftGroupMembers;
use crate::model::SnapshotChunk;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    PreVoteRequest(PreVoteRequest),
    PreVoteResponse(PreVoteResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    TriggerLeaderElectionRequest(TriggerLeaderElectionRequest),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesSuccessResponse(AppendEntriesSuccessResponse),
    AppendEntriesFailureResponse(AppendEntriesFailureResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// Discriminant of a [`RaftMessage`], used by test transports to key
/// per-edge interception rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PreVoteRequest,
    PreVoteResponse,
    VoteRequest,
    VoteResponse,
    TriggerLeaderElectionRequest,
    AppendEntriesRequest,
    AppendEntriesSuccessResponse,
    AppendEntriesFailureResponse,
    InstallSnapshotRequest,
    InstallSnapshotResponse,
}

impl RaftMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RaftMessage::PreVoteRequest(_) => MessageKind::PreVoteRequest,
            RaftMessage::PreVoteResponse(_) => MessageKind::PreVoteResponse,
            RaftMessage::VoteRequest(_) => MessageKind::VoteRequest,
            RaftMessage::VoteResponse(_) => MessageKind::VoteResponse,
            RaftMessage::TriggerLeaderElectionRequest(_) => {
                MessageKind::TriggerLeaderElectionRequest
            }
            RaftMessage::AppendEntriesRequest(_) => MessageKind::AppendEntriesRequest,
            RaftMessage::AppendEntriesSuccessResponse(_) => {
                MessageKind::AppendEntriesSuccessResponse
            }
            RaftMessage::AppendEntriesFailureResponse(_) => {
                MessageKind::AppendEntriesFailureResponse
            }
            RaftMessage::InstallSnapshotRequest(_) => MessageKind::InstallSnapshotRequest,
            RaftMessage::InstallSnapshotResponse(_) => MessageKind::InstallSnapshotResponse,
        }
    }

    pub fn group_id(&self) -> &str {
        match self {
            RaftMessage::PreVoteRequest(m) => &m.group_id,
            RaftMessage::PreVoteResponse(m) => &m.group_id,
            RaftMessage::VoteRequest(m) => &m.group_id,
            RaftMessage::VoteResponse(m) => &m.group_id,
            RaftMessage::TriggerLeaderElectionRequest(m) => &m.group_id,
            RaftMessage::AppendEntriesRequest(m) => &m.group_id,
            RaftMessage::AppendEntriesSuccessResponse(m) => &m.group_id,
            RaftMessage::AppendEntriesFailureResponse(m) => &m.group_id,
            RaftMessage::InstallSnapshotRequest(m) => &m.group_id,
            RaftMessage::InstallSnapshotResponse(m) => &m.group_id,
        }
    }

    pub fn sender(&self) -> &RaftEndpoint {
        match self {
            RaftMessage::PreVoteRequest(m) => &m.sender,
            RaftMessage::PreVoteResponse(m) => &m.sender,
            RaftMessage::VoteRequest(m) => &m.sender,
            RaftMessage::VoteResponse(m) => &m.sender,
            RaftMessage::TriggerLeaderElectionRequest(m) => &m.sender,
            RaftMessage::AppendEntriesRequest(m) => &m.sender,
            RaftMessage::AppendEntriesSuccessResponse(m) => &m.sender,
            RaftMessage::AppendEntriesFailureResponse(m) => &m.sender,
            RaftMessage::InstallSnapshotRequest(m) => &m.sender,
            RaftMessage::InstallSnapshotResponse(m) => &m.sender,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::PreVoteRequest(m) => m.term,
            RaftMessage::PreVoteResponse(m) => m.term,
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::TriggerLeaderElectionRequest(m) => m.term,
            RaftMessage::AppendEntriesRequest(m) => m.term,
            RaftMessage::AppendEntriesSuccessResponse(m) => m.term,
            RaftMessage::AppendEntriesFailureResponse(m) => m.term,
            RaftMessage::InstallSnapshotRequest(m) => m.term,
            RaftMessage::InstallSnapshotResponse(m) => m.term,
        }
    }
}

/// Non-binding canvassing round before a real candidacy: "would you vote
/// for me in term `term` without bumping your own term?". Prevents
/// disruptive term inflation from partitioned nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub group_id: String,
    pub sender: RaftEndpoint,
    /// The term the sender would start a candidacy for (its current term
    /// plus one). Receivers do not adopt it.
    pub term: u64,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub last_log_term: u64,
    pub last_log_index: u64,
    /// Set on the leadership-transfer path: the receiver skips the
    /// leader-stickiness check and may vote even though it heard from a
    /// live leader recently.
    pub disruptive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub granted: bool,
}

/// Sent by a leader to a chosen up-to-date follower to force an immediate
/// election for a planned leadership handoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerLeaderElectionRequest {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub last_log_term: u64,
    pub last_log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub prev_log_term: u64,
    pub prev_log_index: u64,
    pub commit_index: u64,
    pub entries: Vec<LogEntry>,
    /// Highest linearizable-query sequence number issued by the leader;
    /// echoed back so the leader learns which reads are safe to serve.
    pub query_seq_no: u64,
    /// Backpressure credit: increases only when the follower acknowledged
    /// the previous entry-carrying batch.
    pub flow_control_seq_no: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesSuccessResponse {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    /// Index of the last entry the follower matched or appended.
    pub last_log_index: u64,
    pub query_seq_no: u64,
    pub flow_control_seq_no: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesFailureResponse {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    /// The responder's actual last log index so the sender can back off
    /// `next_index` in one step instead of decrementing linearly.
    pub last_log_index: u64,
    pub query_seq_no: u64,
    pub flow_control_seq_no: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    /// Whether the sender is the group leader (chunk-serving peers answer
    /// requests with this flag cleared).
    pub sender_leader: bool,
    pub snapshot_term: u64,
    pub snapshot_index: u64,
    pub chunk_count: u64,
    /// The chunks the sender is pushing with this request. A leader's
    /// periodic announcement carries none; answers to a chunk request
    /// carry the requested fragment.
    pub chunks: Vec<SnapshotChunk>,
    /// Membership embedded in the snapshot.
    pub group_members: RaftGroupMembers,
    /// Members the sender knows already hold this snapshot; lets the
    /// receiver pull chunks from peers instead of only the leader.
    pub snapshotted_members: Vec<RaftEndpoint>,
    pub query_seq_no: u64,
    pub flow_control_seq_no: u64,
}

/// A chunk request from the collecting follower to a chosen snapshot
/// source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub group_id: String,
    pub sender: RaftEndpoint,
    pub term: u64,
    pub snapshot_index: u64,
    pub requested_chunk_index: u64,
    pub query_seq_no: u64,
}
