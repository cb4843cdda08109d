//! Log replication: leader fan-out with per-follower flow control, the
//! follower append path with conflict repair and capacity enforcement,
//! client replicates, and quorum-acknowledged reads.

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PendingQuery;
use super::RaftCore;
use super::RaftRole;
use super::ReplicateWaiter;
use super::TransferState;
use super::WaiterReply;
use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::AppendEntriesFailureResponse;
use crate::model::AppendEntriesRequest;
use crate::model::AppendEntriesSuccessResponse;
use crate::model::LogEntry;
use crate::model::Operation;
use crate::model::Ordered;
use crate::model::RaftEndpoint;
use crate::model::RaftMessage;
use crate::model::TriggerLeaderElectionRequest;
use crate::node::QueryPolicy;
use crate::node::RaftNodeStatus;
use tokio::sync::oneshot;

impl RaftCore {
    /// Sends an append (or a snapshot announcement, for followers behind
    /// the snapshot) to every remote committed member.
    pub(crate) fn broadcast_append_entries(&mut self) -> Result<()> {
        for member in self.remote_members() {
            self.send_append_entries(&member)?;
        }
        Ok(())
    }

    pub(crate) fn send_append_entries(&mut self, target: &RaftEndpoint) -> Result<()> {
        let Some(message) = self.build_append_request(target)? else {
            return Ok(());
        };
        self.send(target, message);
        Ok(())
    }

    fn build_append_request(&mut self, target: &RaftEndpoint) -> Result<Option<RaftMessage>> {
        let snapshot_index = self.log.snapshot_index();
        let last_log_index = self.log.last_log_index();
        let batch = self.config.append_entries_request_batch_size;
        let RaftRole::Leader(state) = &mut self.role else {
            return Ok(None);
        };
        let Some(progress) = state.progress.get_mut(target) else {
            return Ok(None);
        };
        if progress.next_index <= snapshot_index {
            // The entries this follower needs were compacted away.
            return self.build_snapshot_announcement(target).map(Some);
        }
        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self
            .log
            .term_of(prev_log_index)?
            .ok_or(RaftError::InvalidLogIndex {
                index: prev_log_index,
                reason: "previous entry neither in log nor at snapshot boundary".into(),
            })?;
        let entries: Vec<LogEntry> =
            if progress.next_index <= last_log_index && progress.can_send_entries() {
                let to = last_log_index.min(progress.next_index + batch - 1);
                self.log.entries(progress.next_index, to)?
            } else {
                Vec::new()
            };
        if !entries.is_empty() {
            // One outstanding entry batch at a time; heartbeats are not
            // flow-controlled.
            progress.flow_control_seq_no += 1;
        }
        let flow_control_seq_no = progress.flow_control_seq_no;
        Ok(Some(RaftMessage::AppendEntriesRequest(
            AppendEntriesRequest {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                prev_log_term,
                prev_log_index,
                commit_index: self.commit_index,
                entries,
                query_seq_no: state.query_seq_no,
                flow_control_seq_no,
            },
        )))
    }

    pub(crate) fn handle_append_entries_request(&mut self, m: AppendEntriesRequest) -> Result<()> {
        if m.term < self.term {
            self.send_append_failure(&m.sender, &m);
            return Ok(());
        }
        if matches!(self.role, RaftRole::Leader(_)) && m.term == self.term {
            warn!(node = %self.endpoint, from = %m.sender, "two leaders in the same term");
            return Ok(());
        }
        self.step_down(m.term, Some(m.sender.clone()))?;

        // Log matching check on the previous entry.
        let snapshot_index = self.log.snapshot_index();
        if m.prev_log_index < snapshot_index {
            // Everything at or below the snapshot index is committed
            // state; tell the leader where to resume.
            self.send_append_success(&m.sender, &m, snapshot_index);
            return Ok(());
        }
        match self.log.term_of(m.prev_log_index)? {
            Some(term) if term == m.prev_log_term => {}
            _ => {
                debug!(
                    node = %self.endpoint,
                    prev = m.prev_log_index,
                    "append rejected, previous entry does not match"
                );
                self.send_append_failure(&m.sender, &m);
                return Ok(());
            }
        }

        let matched = self.append_from_leader(&m)?;
        // Commit only what this request verified; entries past `matched`
        // may be an uncommitted suffix from an older leader.
        let commit_index = m.commit_index.min(matched);
        if commit_index > self.commit_index {
            self.commit_index = commit_index;
            self.apply_committed_entries()?;
        }
        self.send_append_success(&m.sender, &m, matched);
        Ok(())
    }

    /// Integrates the leader's batch: skips already-matching entries,
    /// truncates on the first conflict, enforces the log capacity, and
    /// appends the remainder. Returns the highest index now known to
    /// match the leader.
    fn append_from_leader(&mut self, m: &AppendEntriesRequest) -> Result<u64> {
        let mut matched = m.prev_log_index;
        let mut to_append: Vec<LogEntry> = Vec::new();
        for entry in &m.entries {
            if !to_append.is_empty() {
                to_append.push(entry.clone());
                continue;
            }
            match self.log.term_of(entry.index)? {
                Some(term) if term == entry.term => {
                    matched = entry.index;
                }
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(RaftError::Fatal(format!(
                            "leader batch conflicts with committed entry at {}",
                            entry.index
                        )));
                    }
                    self.truncate_log_from(entry.index)?;
                    to_append.push(entry.clone());
                }
                None => {
                    to_append.push(entry.clone());
                }
            }
        }
        // A follower's log is bounded; an oversized batch is cut down to
        // what fits and the leader re-sends the rest once entries are
        // compacted into a snapshot.
        let max_last_index = self.log.snapshot_index()
            + self.config.commit_count_to_take_snapshot
            + self.config.max_uncommitted_log_entry_count;
        if let Some(last) = to_append.last() {
            if last.index > max_last_index {
                let keep = to_append
                    .iter()
                    .take_while(|e| e.index <= max_last_index)
                    .count();
                warn!(
                    node = %self.endpoint,
                    dropped = to_append.len() - keep,
                    "append batch exceeds log capacity, truncating"
                );
                to_append.truncate(keep);
            }
        }
        if let Some(last) = to_append.last() {
            matched = last.index;
            self.track_effective_membership(&to_append);
            self.log.append(&to_append)?;
        }
        Ok(matched)
    }

    /// Truncates the log suffix and fails completions attached to the
    /// dropped entries; whether those operations took effect is unknown.
    pub(crate) fn truncate_log_from(&mut self, index: u64) -> Result<()> {
        let dropped = self.log.truncate_from(index)?;
        for entry in &dropped {
            if let Some(waiter) = self.waiters.remove(&entry.index) {
                super::fail_waiter(waiter, RaftError::IndeterminateState);
            }
        }
        if self.effective_members.log_index() >= index {
            // The pending membership change was overwritten.
            self.effective_members = self.committed_members.clone();
            if self.status == RaftNodeStatus::UpdatingMembers {
                self.status = RaftNodeStatus::Active;
            }
        }
        Ok(())
    }

    /// Records the pending membership from any change entries in an
    /// appended batch.
    fn track_effective_membership(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if let Operation::UpdateGroupMembers(op) = &entry.operation {
                match self.committed_members.apply(op, entry.index) {
                    Ok(members) => self.effective_members = members,
                    Err(e) => {
                        warn!(node = %self.endpoint, error = %e, "unappliable membership entry");
                    }
                }
            }
        }
    }

    fn send_append_success(&self, target: &RaftEndpoint, m: &AppendEntriesRequest, matched: u64) {
        self.send(
            target,
            RaftMessage::AppendEntriesSuccessResponse(AppendEntriesSuccessResponse {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                last_log_index: matched,
                query_seq_no: m.query_seq_no,
                flow_control_seq_no: m.flow_control_seq_no,
            }),
        );
    }

    fn send_append_failure(&self, target: &RaftEndpoint, m: &AppendEntriesRequest) {
        self.send(
            target,
            RaftMessage::AppendEntriesFailureResponse(AppendEntriesFailureResponse {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                last_log_index: self.log.last_log_index(),
                query_seq_no: m.query_seq_no,
                flow_control_seq_no: m.flow_control_seq_no,
            }),
        );
    }

    pub(crate) fn handle_append_entries_success(
        &mut self,
        m: AppendEntriesSuccessResponse,
    ) -> Result<()> {
        if m.term > self.term {
            return self.step_down(m.term, None);
        }
        let snapshot_index = self.log.snapshot_index();
        let last_log_index = self.log.last_log_index();
        let RaftRole::Leader(state) = &mut self.role else {
            return Ok(());
        };
        let Some(progress) = state.progress.get_mut(&m.sender) else {
            return Ok(());
        };
        progress.match_index = progress.match_index.max(m.last_log_index);
        progress.next_index = progress.next_index.max(progress.match_index + 1);
        progress.acked_flow_control_seq_no =
            progress.acked_flow_control_seq_no.max(m.flow_control_seq_no);
        progress.acked_query_seq_no = progress.acked_query_seq_no.max(m.query_seq_no);
        progress.last_response_at = Instant::now();
        let caught_up = progress.match_index >= last_log_index;
        let more_to_send = progress.next_index <= last_log_index && progress.can_send_entries();
        if snapshot_index > 0 && progress.match_index >= snapshot_index {
            state.snapshotted_members.insert(m.sender.clone());
        }
        self.advance_commit_index()?;
        self.resolve_pending_queries()?;
        if caught_up {
            self.try_complete_transfer(&m.sender);
        }
        if more_to_send {
            self.send_append_entries(&m.sender)?;
        }
        Ok(())
    }

    pub(crate) fn handle_append_entries_failure(
        &mut self,
        m: AppendEntriesFailureResponse,
    ) -> Result<()> {
        if m.term > self.term {
            return self.step_down(m.term, None);
        }
        let RaftRole::Leader(state) = &mut self.role else {
            return Ok(());
        };
        let Some(progress) = state.progress.get_mut(&m.sender) else {
            return Ok(());
        };
        // Step below the prev index that just failed, jumping straight to
        // the follower's log end when it is shorter. Without the decrement
        // an equal-length conflicting suffix would retry the same prev.
        progress.next_index = progress
            .next_index
            .saturating_sub(1)
            .min(m.last_log_index + 1)
            .max(progress.match_index + 1)
            .max(1);
        progress.acked_flow_control_seq_no =
            progress.acked_flow_control_seq_no.max(m.flow_control_seq_no);
        progress.acked_query_seq_no = progress.acked_query_seq_no.max(m.query_seq_no);
        progress.last_response_at = Instant::now();
        self.send_append_entries(&m.sender)
    }

    /// Appends a client operation on the leader and registers a
    /// completion resolved when the entry commits. Rejections go straight
    /// to the caller.
    pub(crate) fn replicate(
        &mut self,
        operation: Operation,
        reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
    ) -> Result<()> {
        if let Err(rejection) = self.check_replicate_allowed(&operation) {
            let _ = reply.send(Err(rejection));
            return Ok(());
        }
        let index = self.log.last_log_index() + 1;
        let entry = LogEntry {
            index,
            term: self.term,
            operation,
        };
        self.log.append(std::slice::from_ref(&entry))?;
        self.waiters.insert(
            index,
            ReplicateWaiter {
                term: self.term,
                reply: WaiterReply::Command(reply),
            },
        );
        self.broadcast_append_entries()?;
        self.advance_commit_index()
    }

    fn check_replicate_allowed(&self, operation: &Operation) -> Result<()> {
        if self.status == RaftNodeStatus::Terminated {
            return Err(RaftError::Terminated);
        }
        let RaftRole::Leader(state) = &self.role else {
            return Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            });
        };
        if state.transfer.is_some() {
            return Err(RaftError::CannotReplicate {
                reason: "leadership transfer in progress".into(),
            });
        }
        let uncommitted = self.log.last_log_index() - self.commit_index;
        // The last uncommitted slot stays reserved for a membership
        // change so reconfiguration cannot be starved out by commands.
        let limit = if operation.is_membership_change() || operation.is_terminate_group() {
            self.config.max_uncommitted_log_entry_count
        } else {
            self.config.max_uncommitted_log_entry_count - 1
        };
        if uncommitted >= limit {
            return Err(RaftError::CannotReplicate {
                reason: format!("{uncommitted} uncommitted log entries"),
            });
        }
        Ok(())
    }

    pub(crate) fn handle_query(
        &mut self,
        command: Vec<u8>,
        policy: QueryPolicy,
        reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
    ) -> Result<()> {
        if self.status == RaftNodeStatus::Terminated {
            let _ = reply.send(Err(RaftError::Terminated));
            return Ok(());
        }
        match policy {
            QueryPolicy::Eventual => {
                let result = self.state_machine.query(&command);
                let _ = reply.send(Ok(Ordered::new(self.commit_index, result)));
                Ok(())
            }
            QueryPolicy::LeaderLocal => {
                if !matches!(self.role, RaftRole::Leader(_)) {
                    let _ = reply.send(Err(RaftError::NotLeader {
                        leader: self.leader.clone(),
                    }));
                    return Ok(());
                }
                let result = self.state_machine.query(&command);
                let _ = reply.send(Ok(Ordered::new(self.commit_index, result)));
                Ok(())
            }
            QueryPolicy::Linearizable => self.handle_linearizable_query(command, reply),
        }
    }

    /// A linearizable read is answered only after a quorum acknowledges
    /// the read's sequence number, proving this node was still leader
    /// when the query arrived. No log entry is appended.
    fn handle_linearizable_query(
        &mut self,
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Ordered<Vec<u8>>>>,
    ) -> Result<()> {
        if !matches!(self.role, RaftRole::Leader(_)) {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            }));
            return Ok(());
        }
        if self.committed_members.majority() == 1 && self.current_term_committed()? {
            let result = self.state_machine.query(&command);
            let _ = reply.send(Ok(Ordered::new(self.commit_index, result)));
            return Ok(());
        }
        if let RaftRole::Leader(state) = &mut self.role {
            state.query_seq_no += 1;
            state.pending_queries.push(PendingQuery {
                seq_no: state.query_seq_no,
                command,
                reply,
            });
        }
        // Solicit acknowledgements right away.
        self.broadcast_append_entries()
    }

    /// A fresh leader's commit index may trail entries committed under
    /// the previous leader; reads are held until it commits an entry of
    /// its own term.
    fn current_term_committed(&self) -> Result<bool> {
        Ok(self.log.term_of(self.commit_index)? == Some(self.term))
    }

    /// Answers every pending query whose sequence number a quorum has
    /// acknowledged, once the leader has committed an entry of the
    /// current term.
    pub(crate) fn resolve_pending_queries(&mut self) -> Result<()> {
        let has_pending =
            matches!(&self.role, RaftRole::Leader(state) if !state.pending_queries.is_empty());
        if !has_pending || !self.current_term_committed()? {
            return Ok(());
        }
        let majority = self.committed_members.majority();
        let commit_index = self.commit_index;
        let RaftRole::Leader(state) = &mut self.role else {
            return Ok(());
        };
        let mut acked: Vec<u64> = self
            .committed_members
            .members()
            .iter()
            .map(|member| {
                if *member == self.endpoint {
                    state.query_seq_no
                } else {
                    state
                        .progress
                        .get(member)
                        .map_or(0, |p| p.acked_query_seq_no)
                }
            })
            .collect();
        acked.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_seq_no = acked.get(majority - 1).copied().unwrap_or(0);
        let mut remaining = Vec::new();
        for query in state.pending_queries.drain(..) {
            if query.seq_no <= quorum_seq_no {
                let result = self.state_machine.query(&query.command);
                let _ = query.reply.send(Ok(Ordered::new(commit_index, result)));
            } else {
                remaining.push(query);
            }
        }
        state.pending_queries = remaining;
        Ok(())
    }

    pub(crate) fn handle_transfer_leadership(
        &mut self,
        target: RaftEndpoint,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !matches!(self.role, RaftRole::Leader(_)) {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            }));
            return Ok(());
        }
        if target == self.endpoint {
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        if !self.committed_members.contains(&target) {
            let _ = reply.send(Err(RaftError::LeadershipTransfer(format!(
                "{target} is not a member of the group"
            ))));
            return Ok(());
        }
        if let RaftRole::Leader(state) = &mut self.role {
            if state.transfer.is_some() {
                let _ = reply.send(Err(RaftError::LeadershipTransfer(
                    "a leadership transfer is already in progress".into(),
                )));
                return Ok(());
            }
            info!(node = %self.endpoint, target = %target, "starting leadership transfer");
            state.transfer = Some(TransferState {
                target: target.clone(),
                reply: Some(reply),
            });
        }
        self.try_complete_transfer(&target);
        // Push the target's log forward if it is behind.
        self.send_append_entries(&target)
    }

    /// Hands leadership to the transfer target once its log fully
    /// matches ours.
    fn try_complete_transfer(&mut self, responder: &RaftEndpoint) {
        let last_log_index = self.log.last_log_index();
        let last_log_term = self.log.last_log_term();
        let group_id = self.group_id.clone();
        let endpoint = self.endpoint.clone();
        let term = self.term;
        let RaftRole::Leader(state) = &mut self.role else {
            return;
        };
        let Some(transfer) = &mut state.transfer else {
            return;
        };
        if transfer.target != *responder {
            return;
        }
        let caught_up = state
            .progress
            .get(responder)
            .is_some_and(|p| p.match_index >= last_log_index);
        if !caught_up {
            return;
        }
        info!(node = %endpoint, target = %responder, "transfer target caught up, handing off");
        if let Some(reply) = transfer.reply.take() {
            let _ = reply.send(Ok(()));
        }
        state.transfer = None;
        self.send(
            responder,
            RaftMessage::TriggerLeaderElectionRequest(TriggerLeaderElectionRequest {
                group_id,
                sender: endpoint,
                term,
                last_log_term,
                last_log_index,
            }),
        );
    }
}
