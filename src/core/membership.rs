//! Single-change membership reconfiguration. At most one uncommitted
//! change entry may exist in the log; quorum sizes always come from the
//! committed membership, so a pending change never shifts vote counting.

use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;

use super::Progress;
use super::RaftCore;
use super::RaftRole;
use super::ReplicateWaiter;
use super::WaiterReply;
use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::LogEntry;
use crate::model::MembershipChangeMode;
use crate::model::Operation;
use crate::model::Ordered;
use crate::model::RaftEndpoint;
use crate::model::RaftGroupMembers;
use crate::model::UpdateGroupMembersOp;
use crate::node::RaftNodeStatus;

impl RaftCore {
    pub(crate) fn handle_change_membership(
        &mut self,
        endpoint: RaftEndpoint,
        mode: MembershipChangeMode,
        expected_members_log_index: u64,
        reply: oneshot::Sender<Result<Ordered<RaftGroupMembers>>>,
    ) -> Result<()> {
        let index = self.log.last_log_index() + 1;
        let op = UpdateGroupMembersOp { endpoint, mode };
        let new_members = match self.check_membership_change_allowed(&op, expected_members_log_index, index) {
            Ok(members) => members,
            Err(rejection) => {
                let _ = reply.send(Err(rejection));
                return Ok(());
            }
        };
        info!(
            node = %self.endpoint,
            index,
            members = %new_members,
            "appending membership change"
        );
        let entry = LogEntry {
            index,
            term: self.term,
            operation: Operation::UpdateGroupMembers(op),
        };
        self.log.append(std::slice::from_ref(&entry))?;
        self.effective_members = new_members;
        self.status = RaftNodeStatus::UpdatingMembers;
        self.waiters.insert(
            index,
            ReplicateWaiter {
                term: self.term,
                reply: WaiterReply::Membership(reply),
            },
        );
        self.broadcast_append_entries()?;
        self.advance_commit_index()
    }

    fn check_membership_change_allowed(
        &self,
        op: &UpdateGroupMembersOp,
        expected_members_log_index: u64,
        index: u64,
    ) -> Result<RaftGroupMembers> {
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
        if self.status == RaftNodeStatus::UpdatingMembers
            || self.effective_members.log_index() > self.committed_members.log_index()
        {
            return Err(RaftError::CannotReplicate {
                reason: "a membership change is already in progress".into(),
            });
        }
        if expected_members_log_index != self.committed_members.log_index() {
            return Err(RaftError::MismatchingGroupMembersCommitIndex {
                expected: expected_members_log_index,
                actual: self.committed_members.log_index(),
            });
        }
        let uncommitted = self.log.last_log_index() - self.commit_index;
        if uncommitted >= self.config.max_uncommitted_log_entry_count {
            return Err(RaftError::CannotReplicate {
                reason: format!("{uncommitted} uncommitted log entries"),
            });
        }
        self.committed_members.apply(op, index)
    }

    /// A committed membership change takes effect everywhere it is
    /// applied: quorum bookkeeping, leader progress and, for a removed
    /// local endpoint, the life of the node itself.
    pub(crate) fn apply_membership_entry(
        &mut self,
        index: u64,
        entry_term: u64,
        op: UpdateGroupMembersOp,
    ) -> Result<()> {
        let new_members = match self.committed_members.apply(&op, index) {
            Ok(members) => members,
            Err(e) => {
                warn!(node = %self.endpoint, index, error = %e, "skipping unappliable membership entry");
                return Ok(());
            }
        };
        info!(node = %self.endpoint, index, members = %new_members, "membership change committed");
        let removed: Vec<RaftEndpoint> = self
            .committed_members
            .members()
            .iter()
            .filter(|member| !new_members.contains(member) && **member != self.endpoint)
            .cloned()
            .collect();
        self.committed_members = new_members.clone();
        if self.effective_members.log_index() <= index {
            self.effective_members = new_members.clone();
        }
        if self.status == RaftNodeStatus::UpdatingMembers {
            self.status = RaftNodeStatus::Active;
        }
        if matches!(self.role, RaftRole::Leader(_)) {
            // One last append per removed member, while its progress still
            // exists, so it observes the commit and terminates itself.
            for member in &removed {
                self.send_append_entries(member)?;
            }
        }
        if let RaftRole::Leader(state) = &mut self.role {
            let next_index = self.log.last_log_index() + 1;
            state
                .progress
                .retain(|member, _| new_members.contains(member));
            state
                .snapshotted_members
                .retain(|member| new_members.contains(member));
            for member in new_members.members() {
                if *member != self.endpoint {
                    state
                        .progress
                        .entry(member.clone())
                        .or_insert_with(|| Progress::new(next_index));
                }
            }
        }
        self.resolve_membership_waiter(index, entry_term, new_members.clone());
        if !new_members.contains(&self.endpoint) {
            info!(node = %self.endpoint, "removed from the group, terminating");
            self.status = RaftNodeStatus::Terminated;
        }
        Ok(())
    }

    fn resolve_membership_waiter(
        &mut self,
        index: u64,
        entry_term: u64,
        members: RaftGroupMembers,
    ) {
        let Some(waiter) = self.waiters.remove(&index) else {
            return;
        };
        if waiter.term != entry_term {
            super::fail_waiter(waiter, RaftError::IndeterminateState);
            return;
        }
        match waiter.reply {
            WaiterReply::Membership(reply) => {
                let _ = reply.send(Ok(Ordered::new(index, members)));
            }
            WaiterReply::Command(reply) => {
                let _ = reply.send(Err(RaftError::IndeterminateState));
            }
        }
    }
}
