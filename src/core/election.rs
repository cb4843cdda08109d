//! Leader election: pre-vote canvassing, real candidacies, vote grants
//! with leader stickiness, and planned leadership handoff.

use std::collections::BTreeSet;
use std::collections::HashMap;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CandidateState;
use super::ElectionTimer;
use super::LeaderState;
use super::Progress;
use super::RaftCore;
use super::RaftRole;
use crate::errors::Result;
use crate::model::PreVoteRequest;
use crate::model::PreVoteResponse;
use crate::model::RaftMessage;
use crate::model::TriggerLeaderElectionRequest;
use crate::model::VoteRequest;
use crate::model::VoteResponse;

impl RaftCore {
    pub(crate) fn handle_election_timeout(&mut self) -> Result<()> {
        if !self.committed_members.contains(&self.endpoint)
            && !self.effective_members.contains(&self.endpoint)
        {
            // Not (yet) a voting member; keep waiting for a leader.
            if let RaftRole::Follower(state) = &mut self.role {
                state.election_timer.reset();
            }
            return Ok(());
        }
        debug!(node = %self.endpoint, term = self.term, "election timeout, starting pre-vote");
        self.leader = None;
        let mut granted = BTreeSet::new();
        granted.insert(self.endpoint.clone());
        self.role = RaftRole::Candidate(CandidateState {
            pre_vote: true,
            disruptive: false,
            granted,
            election_timer: ElectionTimer::new(&self.config),
        });
        if self.committed_members.majority() == 1 {
            return self.start_election(false);
        }
        let request = RaftMessage::PreVoteRequest(PreVoteRequest {
            group_id: self.group_id.clone(),
            sender: self.endpoint.clone(),
            term: self.term + 1,
            last_log_term: self.log.last_log_term(),
            last_log_index: self.log.last_log_index(),
        });
        for member in self.remote_members() {
            self.send(&member, request.clone());
        }
        Ok(())
    }

    fn start_election(&mut self, disruptive: bool) -> Result<()> {
        self.term += 1;
        self.voted_for = Some(self.endpoint.clone());
        self.persist_hard_state()?;
        self.leader = None;
        info!(node = %self.endpoint, term = self.term, disruptive, "starting election");
        let mut granted = BTreeSet::new();
        granted.insert(self.endpoint.clone());
        self.role = RaftRole::Candidate(CandidateState {
            pre_vote: false,
            disruptive,
            granted,
            election_timer: ElectionTimer::new(&self.config),
        });
        if self.committed_members.majority() == 1 {
            return self.become_leader();
        }
        let request = RaftMessage::VoteRequest(VoteRequest {
            group_id: self.group_id.clone(),
            sender: self.endpoint.clone(),
            term: self.term,
            last_log_term: self.log.last_log_term(),
            last_log_index: self.log.last_log_index(),
            disruptive,
        });
        for member in self.remote_members() {
            self.send(&member, request.clone());
        }
        Ok(())
    }

    pub(crate) fn handle_pre_vote_request(&mut self, m: PreVoteRequest) -> Result<()> {
        // Pre-votes are non-binding: no term adoption, no vote record.
        let granted = m.term > self.term
            && self.log_up_to_date(m.last_log_term, m.last_log_index)
            && !self.heard_from_leader_recently();
        debug!(
            node = %self.endpoint,
            candidate = %m.sender,
            requested_term = m.term,
            granted,
            "pre-vote request"
        );
        self.send(
            &m.sender,
            RaftMessage::PreVoteResponse(PreVoteResponse {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                granted,
            }),
        );
        Ok(())
    }

    pub(crate) fn handle_pre_vote_response(&mut self, m: PreVoteResponse) -> Result<()> {
        if m.term > self.term {
            return self.step_down(m.term, None);
        }
        let majority = self.committed_members.majority();
        let RaftRole::Candidate(state) = &mut self.role else {
            return Ok(());
        };
        if !state.pre_vote || !m.granted {
            return Ok(());
        }
        state.granted.insert(m.sender);
        if state.granted.len() >= majority {
            let disruptive = state.disruptive;
            return self.start_election(disruptive);
        }
        Ok(())
    }

    pub(crate) fn handle_vote_request(&mut self, m: VoteRequest) -> Result<()> {
        if m.term < self.term {
            self.send_vote_response(&m.sender, false);
            return Ok(());
        }
        if !m.disruptive && self.heard_from_leader_recently() {
            // Leader stickiness: a node that recently heard from a live
            // leader refuses to help depose it, and does not even adopt
            // the candidate's term.
            debug!(node = %self.endpoint, candidate = %m.sender, "rejecting vote, leader is alive");
            self.send_vote_response(&m.sender, false);
            return Ok(());
        }
        if m.term > self.term {
            self.step_down(m.term, None)?;
        }
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == m.sender,
        };
        let granted = can_vote && self.log_up_to_date(m.last_log_term, m.last_log_index);
        if granted {
            self.voted_for = Some(m.sender.clone());
            self.persist_hard_state()?;
            if let RaftRole::Follower(state) = &mut self.role {
                state.election_timer.reset();
            }
        }
        debug!(node = %self.endpoint, candidate = %m.sender, term = m.term, granted, "vote request");
        self.send_vote_response(&m.sender, granted);
        Ok(())
    }

    fn send_vote_response(&self, target: &crate::model::RaftEndpoint, granted: bool) {
        self.send(
            target,
            RaftMessage::VoteResponse(VoteResponse {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                granted,
            }),
        );
    }

    pub(crate) fn handle_vote_response(&mut self, m: VoteResponse) -> Result<()> {
        if m.term > self.term {
            return self.step_down(m.term, None);
        }
        let majority = self.committed_members.majority();
        let RaftRole::Candidate(state) = &mut self.role else {
            return Ok(());
        };
        if state.pre_vote || !m.granted || m.term < self.term {
            return Ok(());
        }
        state.granted.insert(m.sender);
        if state.granted.len() >= majority {
            return self.become_leader();
        }
        Ok(())
    }

    /// The chosen successor of a planned handoff starts an immediate
    /// disruptive election, skipping the pre-vote round.
    pub(crate) fn handle_trigger_leader_election(
        &mut self,
        m: TriggerLeaderElectionRequest,
    ) -> Result<()> {
        if m.term < self.term {
            return Ok(());
        }
        if m.term > self.term {
            self.step_down(m.term, None)?;
        }
        if self.log.last_log_index() != m.last_log_index
            || self.log.last_log_term() != m.last_log_term
        {
            warn!(
                node = %self.endpoint,
                from = %m.sender,
                "ignoring leadership handoff, log does not match the leader's"
            );
            return Ok(());
        }
        info!(node = %self.endpoint, from = %m.sender, "taking over leadership");
        self.start_election(true)
    }

    fn become_leader(&mut self) -> Result<()> {
        info!(node = %self.endpoint, term = self.term, "elected leader");
        self.leader = Some(self.endpoint.clone());
        self.last_leader_contact = Some(Instant::now());
        let mut progress = HashMap::new();
        for member in self.remote_members() {
            progress.insert(member, Progress::new(self.log.last_log_index() + 1));
        }
        let mut snapshotted_members = BTreeSet::new();
        snapshotted_members.insert(self.endpoint.clone());
        self.role = RaftRole::Leader(LeaderState {
            progress,
            heartbeat_deadline: Instant::now() + self.config.leader_heartbeat_period(),
            query_seq_no: 0,
            pending_queries: Vec::new(),
            transfer: None,
            snapshotted_members,
        });
        self.broadcast_append_entries()?;
        self.advance_commit_index()
    }

    /// Raft's up-to-date rule: the candidate's log wins on last term,
    /// then on last index.
    fn log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_log_term(), self.log.last_log_index())
    }
}
