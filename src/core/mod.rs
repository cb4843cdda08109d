//! The consensus actor. Every node runs one [`RaftCore`] on a dedicated
//! task; all protocol state is owned by that task and mutated only from
//! its event loop, so no handler ever observes a half-applied transition.

mod election;
mod membership;
mod replication;
mod snapshot;
mod timer;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

pub(crate) use snapshot::SnapshotChunkCollector;
use timer::ElectionTimer;

use crate::config::RaftConfig;
use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::HardState;
use crate::model::MembershipChangeMode;
use crate::model::Operation;
use crate::model::Ordered;
use crate::model::RaftEndpoint;
use crate::model::RaftGroupMembers;
use crate::model::RaftGroupTerm;
use crate::model::RaftMessage;
use crate::node::QueryPolicy;
use crate::node::RaftNodeReport;
use crate::node::RaftNodeRole;
use crate::node::RaftNodeStatus;
use crate::raft_log::RaftLog;
use crate::storage::StateMachine;
use crate::transport::Transport;

/// Everything the actor reacts to besides its own timers.
pub(crate) enum RaftEvent {
    Message(RaftMessage),
    Replicate {
        operation: Operation,
        reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
    },
    Query {
        command: Vec<u8>,
        policy: QueryPolicy,
        reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
    },
    ChangeMembership {
        endpoint: RaftEndpoint,
        mode: MembershipChangeMode,
        expected_members_log_index: u64,
        reply: oneshot::Sender<Result<Ordered<RaftGroupMembers>>>,
    },
    TransferLeadership {
        target: RaftEndpoint,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Per-follower bookkeeping held by a leader.
pub(crate) struct Progress {
    pub(crate) match_index: u64,
    pub(crate) next_index: u64,
    /// Sequence number attached to the last entry-carrying batch sent.
    pub(crate) flow_control_seq_no: u64,
    /// Highest flow-control sequence number the follower echoed back.
    pub(crate) acked_flow_control_seq_no: u64,
    /// Highest query sequence number the follower echoed back.
    pub(crate) acked_query_seq_no: u64,
    pub(crate) last_response_at: Instant,
}

impl Progress {
    fn new(next_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index,
            flow_control_seq_no: 0,
            acked_flow_control_seq_no: 0,
            acked_query_seq_no: 0,
            last_response_at: Instant::now(),
        }
    }

    /// A new entry batch may be sent only when the previous one was
    /// acknowledged.
    pub(crate) fn can_send_entries(&self) -> bool {
        self.acked_flow_control_seq_no >= self.flow_control_seq_no
    }
}

pub(crate) struct FollowerState {
    pub(crate) election_timer: ElectionTimer,
}

pub(crate) struct CandidateState {
    /// A pre-vote round canvasses without bumping terms; winning it
    /// starts the real candidacy.
    pub(crate) pre_vote: bool,
    /// Set on the leadership-transfer path: skip pre-vote and ask peers
    /// to ignore leader stickiness.
    pub(crate) disruptive: bool,
    pub(crate) granted: BTreeSet<RaftEndpoint>,
    pub(crate) election_timer: ElectionTimer,
}

pub(crate) struct PendingQuery {
    pub(crate) seq_no: u64,
    pub(crate) command: Vec<u8>,
    pub(crate) reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
}

pub(crate) struct TransferState {
    pub(crate) target: RaftEndpoint,
    pub(crate) reply: Option<oneshot::Sender<Result<()>>>,
}

pub(crate) struct LeaderState {
    pub(crate) progress: HashMap<RaftEndpoint, Progress>,
    pub(crate) heartbeat_deadline: Instant,
    /// Last linearizable-query sequence number issued.
    pub(crate) query_seq_no: u64,
    pub(crate) pending_queries: Vec<PendingQuery>,
    pub(crate) transfer: Option<TransferState>,
    /// Members known to hold the leader's current snapshot, the leader
    /// itself included. Advertised to installing followers so they can
    /// pull chunks from peers.
    pub(crate) snapshotted_members: BTreeSet<RaftEndpoint>,
}

pub(crate) enum RaftRole {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RaftRole {
    pub(crate) fn kind(&self) -> RaftNodeRole {
        match self {
            RaftRole::Follower(_) => RaftNodeRole::Follower,
            RaftRole::Candidate(_) => RaftNodeRole::Candidate,
            RaftRole::Leader(_) => RaftNodeRole::Leader,
        }
    }
}

/// What a replicate waiter is owed when its entry commits.
pub(crate) enum WaiterReply {
    Command(oneshot::Sender<Result<Ordered<Vec<u8>>>>),
    Membership(oneshot::Sender<Result<Ordered<RaftGroupMembers>>>),
}

pub(crate) struct ReplicateWaiter {
    /// Term the entry was appended in; a committed entry with a different
    /// term means the original was overwritten.
    pub(crate) term: u64,
    pub(crate) reply: WaiterReply,
}

pub(crate) struct RaftCore {
    pub(crate) endpoint: RaftEndpoint,
    pub(crate) group_id: String,
    pub(crate) config: RaftConfig,
    pub(crate) log: RaftLog,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn Transport>,

    pub(crate) status: RaftNodeStatus,
    pub(crate) role: RaftRole,
    pub(crate) term: u64,
    pub(crate) voted_for: Option<RaftEndpoint>,
    pub(crate) leader: Option<RaftEndpoint>,
    pub(crate) last_leader_contact: Option<Instant>,

    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,

    /// Most recently committed membership; quorums are always computed
    /// from this one.
    pub(crate) committed_members: RaftGroupMembers,
    /// Membership including the uncommitted change, when one is in the
    /// log.
    pub(crate) effective_members: RaftGroupMembers,

    /// Completions keyed by the log index they wait on.
    pub(crate) waiters: BTreeMap<u64, ReplicateWaiter>,
    pub(crate) snapshot_collector: Option<SnapshotChunkCollector>,

    event_rx: mpsc::Receiver<RaftEvent>,
    shutdown_rx: watch::Receiver<bool>,
    report: Arc<RwLock<RaftNodeReport>>,
}

impl RaftCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint: RaftEndpoint,
        group_id: String,
        config: RaftConfig,
        log: RaftLog,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        initial_members: RaftGroupMembers,
        event_rx: mpsc::Receiver<RaftEvent>,
        shutdown_rx: watch::Receiver<bool>,
        report: Arc<RwLock<RaftNodeReport>>,
    ) -> Result<Self> {
        let hard_state = log.load_hard_state()?.unwrap_or_default();
        // A snapshot carries the membership committed at its index; it
        // overrides the construction-time member list on restart.
        let members = match log.snapshot()? {
            Some(snapshot) => snapshot.group_members,
            None => initial_members,
        };
        let mut core = Self {
            endpoint,
            group_id,
            role: RaftRole::Follower(FollowerState {
                election_timer: ElectionTimer::new(&config),
            }),
            config,
            log,
            state_machine,
            transport,
            status: RaftNodeStatus::Active,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            last_leader_contact: None,
            commit_index: 0,
            last_applied: 0,
            committed_members: members.clone(),
            effective_members: members,
            waiters: BTreeMap::new(),
            snapshot_collector: None,
            event_rx,
            shutdown_rx,
            report,
        };
        core.restore_from_local_snapshot()?;
        core.publish_report();
        Ok(core)
    }

    /// Re-applies the locally stored snapshot on startup so the state
    /// machine and applied index match the log's snapshot boundary.
    fn restore_from_local_snapshot(&mut self) -> Result<()> {
        if let Some(snapshot) = self.log.snapshot()? {
            self.state_machine.restore(&snapshot.payload())?;
            self.commit_index = snapshot.index;
            self.last_applied = snapshot.index;
        }
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        info!(
            node = %self.endpoint,
            group = %self.group_id,
            term = self.term,
            "raft node started"
        );
        loop {
            let deadline = self.next_deadline();
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    info!(node = %self.endpoint, "shutdown signal received");
                    break;
                }
                _ = sleep_until(deadline) => self.handle_tick(),
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            };
            if let Err(e) = outcome {
                if matches!(e, RaftError::Fatal(_) | RaftError::Storage(_)) {
                    error!(node = %self.endpoint, error = %e, "fatal error, stopping node");
                    self.status = RaftNodeStatus::Terminated;
                } else {
                    warn!(node = %self.endpoint, error = %e, "event handling failed");
                }
            }
            self.publish_report();
            if self.status == RaftNodeStatus::Terminated {
                break;
            }
        }
        self.status = RaftNodeStatus::Terminated;
        self.fail_all_waiters();
        self.publish_report();
        info!(node = %self.endpoint, "raft node stopped");
    }

    fn next_deadline(&self) -> Instant {
        match &self.role {
            RaftRole::Follower(state) => state.election_timer.next_deadline(),
            RaftRole::Candidate(state) => state.election_timer.next_deadline(),
            RaftRole::Leader(state) => state.heartbeat_deadline,
        }
    }

    fn handle_tick(&mut self) -> Result<()> {
        match &self.role {
            RaftRole::Follower(state) => {
                if state.election_timer.is_expired() {
                    self.handle_election_timeout()?;
                }
            }
            RaftRole::Candidate(state) => {
                if state.election_timer.is_expired() {
                    self.handle_election_timeout()?;
                }
            }
            RaftRole::Leader(state) => {
                if state.heartbeat_deadline <= Instant::now() {
                    self.broadcast_append_entries()?;
                    if let RaftRole::Leader(state) = &mut self.role {
                        state.heartbeat_deadline =
                            Instant::now() + self.config.leader_heartbeat_period();
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: RaftEvent) -> Result<()> {
        match event {
            RaftEvent::Message(message) => self.handle_message(message),
            RaftEvent::Replicate { operation, reply } => self.replicate(operation, reply),
            RaftEvent::Query {
                command,
                policy,
                reply,
            } => self.handle_query(command, policy, reply),
            RaftEvent::ChangeMembership {
                endpoint,
                mode,
                expected_members_log_index,
                reply,
            } => self.handle_change_membership(endpoint, mode, expected_members_log_index, reply),
            RaftEvent::TransferLeadership { target, reply } => {
                self.handle_transfer_leadership(target, reply)
            }
        }
    }

    fn handle_message(&mut self, message: RaftMessage) -> Result<()> {
        if message.group_id() != self.group_id {
            warn!(
                node = %self.endpoint,
                from = %message.sender(),
                group = message.group_id(),
                "dropping message for foreign group"
            );
            return Ok(());
        }
        match message {
            RaftMessage::PreVoteRequest(m) => self.handle_pre_vote_request(m),
            RaftMessage::PreVoteResponse(m) => self.handle_pre_vote_response(m),
            RaftMessage::VoteRequest(m) => self.handle_vote_request(m),
            RaftMessage::VoteResponse(m) => self.handle_vote_response(m),
            RaftMessage::TriggerLeaderElectionRequest(m) => {
                self.handle_trigger_leader_election(m)
            }
            RaftMessage::AppendEntriesRequest(m) => self.handle_append_entries_request(m),
            RaftMessage::AppendEntriesSuccessResponse(m) => {
                self.handle_append_entries_success(m)
            }
            RaftMessage::AppendEntriesFailureResponse(m) => {
                self.handle_append_entries_failure(m)
            }
            RaftMessage::InstallSnapshotRequest(m) => self.handle_install_snapshot_request(m),
            RaftMessage::InstallSnapshotResponse(m) => self.handle_install_snapshot_response(m),
        }
    }

    /// Adopts a higher term seen in any message and falls back to
    /// follower.
    pub(crate) fn step_down(&mut self, term: u64, leader: Option<RaftEndpoint>) -> Result<()> {
        let newer_term = term > self.term;
        if newer_term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        if leader.is_some() {
            self.leader = leader;
            self.last_leader_contact = Some(Instant::now());
        } else if newer_term {
            self.leader = None;
        }
        if !matches!(self.role, RaftRole::Follower(_)) {
            info!(node = %self.endpoint, term = self.term, "stepping down to follower");
            self.fail_leader_obligations();
            self.role = RaftRole::Follower(FollowerState {
                election_timer: ElectionTimer::new(&self.config),
            });
        } else if let RaftRole::Follower(state) = &mut self.role {
            state.election_timer.reset();
        }
        Ok(())
    }

    /// A deposed leader cannot know whether its in-flight entries will
    /// survive under the new leader, so their completions are failed as
    /// indeterminate; pending queries are simply no longer servable here.
    fn fail_leader_obligations(&mut self) {
        if let RaftRole::Leader(state) = &mut self.role {
            for query in state.pending_queries.drain(..) {
                let _ = query.reply.send(Err(RaftError::NotLeader {
                    leader: self.leader.clone(),
                }));
            }
            if let Some(mut transfer) = state.transfer.take() {
                if let Some(reply) = transfer.reply.take() {
                    let _ = reply.send(Err(RaftError::LeadershipTransfer(
                        "leadership lost before transfer completed".into(),
                    )));
                }
            }
        }
        let uncommitted: Vec<u64> = self
            .waiters
            .range(self.commit_index + 1..)
            .map(|(&index, _)| index)
            .collect();
        for index in uncommitted {
            if let Some(waiter) = self.waiters.remove(&index) {
                fail_waiter(waiter, RaftError::IndeterminateState);
            }
        }
    }

    fn fail_all_waiters(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        for (_, waiter) in waiters {
            fail_waiter(waiter, RaftError::Terminated);
        }
        if let RaftRole::Leader(state) = &mut self.role {
            for query in state.pending_queries.drain(..) {
                let _ = query.reply.send(Err(RaftError::Terminated));
            }
            if let Some(mut transfer) = state.transfer.take() {
                if let Some(reply) = transfer.reply.take() {
                    let _ = reply.send(Err(RaftError::Terminated));
                }
            }
        }
    }

    pub(crate) fn persist_hard_state(&mut self) -> Result<()> {
        let state = HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
        };
        self.log.persist_hard_state(&state)
    }

    /// Advances the commit index on the leader: the quorum-replicated
    /// index, counted over the committed membership, commits only when
    /// the entry there belongs to the current term.
    pub(crate) fn advance_commit_index(&mut self) -> Result<()> {
        let RaftRole::Leader(state) = &self.role else {
            return Ok(());
        };
        let mut matches: Vec<u64> = self
            .committed_members
            .members()
            .iter()
            .map(|member| {
                if *member == self.endpoint {
                    self.log.last_log_index()
                } else {
                    state.progress.get(member).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let majority = self.committed_members.majority();
        let quorum_index = matches.get(majority - 1).copied().unwrap_or(0);
        if quorum_index <= self.commit_index {
            return Ok(());
        }
        match self.log.term_of(quorum_index)? {
            Some(term) if term == self.term => {
                self.commit_index = quorum_index;
                self.apply_committed_entries()?;
                // Push the new commit index out right away instead of
                // waiting for the next heartbeat.
                self.broadcast_append_entries()?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Applies every committed-but-unapplied entry and resolves the
    /// completions attached to them.
    pub(crate) fn apply_committed_entries(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.entry(index)?.ok_or(RaftError::InvalidLogIndex {
                index,
                reason: "committed entry missing from log".into(),
            })?;
            match &entry.operation {
                Operation::Command(command) => {
                    let result = self.state_machine.apply(index, command);
                    self.resolve_command_waiter(index, entry.term, result);
                }
                Operation::UpdateGroupMembers(op) => {
                    self.apply_membership_entry(index, entry.term, op.clone())?;
                }
                Operation::TerminateGroup => {
                    info!(node = %self.endpoint, index, "group termination committed");
                    self.resolve_command_waiter(index, entry.term, Vec::new());
                    self.status = RaftNodeStatus::Terminated;
                }
            }
            self.last_applied = index;
        }
        self.resolve_pending_queries()?;
        self.maybe_take_snapshot()?;
        Ok(())
    }

    fn resolve_command_waiter(&mut self, index: u64, entry_term: u64, result: Vec<u8>) {
        let Some(waiter) = self.waiters.remove(&index) else {
            return;
        };
        if waiter.term != entry_term {
            // The index committed, but with somebody else's entry.
            fail_waiter(waiter, RaftError::IndeterminateState);
            return;
        }
        match waiter.reply {
            WaiterReply::Command(reply) => {
                let _ = reply.send(Ok(Ordered::new(index, result)));
            }
            WaiterReply::Membership(reply) => {
                // A command committed where a membership change was
                // expected; the change was overwritten.
                let _ = reply.send(Err(RaftError::IndeterminateState));
            }
        }
    }

    pub(crate) fn publish_report(&self) {
        let mut report = self.report.write();
        *report = RaftNodeReport {
            endpoint: self.endpoint.clone(),
            group_id: self.group_id.clone(),
            role: self.role.kind(),
            status: self.status,
            term: RaftGroupTerm {
                term: self.term,
                leader: self.leader.clone(),
            },
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_log_index(),
            snapshot_index: self.log.snapshot_index(),
            committed_members: self.committed_members.clone(),
            effective_members: self.effective_members.clone(),
            installing_snapshot: self.snapshot_collector.is_some(),
        };
    }

    /// True while an append from a live leader arrived within the
    /// stickiness window; such a node refuses to help depose its leader.
    pub(crate) fn heard_from_leader_recently(&self) -> bool {
        match self.last_leader_contact {
            Some(at) => at.elapsed() < self.config.leader_stickiness_window(),
            None => false,
        }
    }

    pub(crate) fn send(&self, target: &RaftEndpoint, message: RaftMessage) {
        self.transport.send(target, message);
    }

    /// Remote members of the committed group.
    pub(crate) fn remote_members(&self) -> Vec<RaftEndpoint> {
        self.committed_members
            .members()
            .iter()
            .filter(|m| **m != self.endpoint)
            .cloned()
            .collect()
    }
}

pub(crate) fn fail_waiter(waiter: ReplicateWaiter, error: RaftError) {
    match waiter.reply {
        WaiterReply::Command(reply) => {
            let _ = reply.send(Err(error));
        }
        WaiterReply::Membership(reply) => {
            let _ = reply.send(Err(error));
        }
    }
}
