//! Snapshot taking, announcement, and chunked transfer. Followers far
//! enough behind that their next entry was compacted receive a snapshot
//! announcement and pull the chunks themselves, spreading the load over
//! every member known to hold the snapshot.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::RaftCore;
use super::RaftRole;
use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::AppendEntriesSuccessResponse;
use crate::model::InstallSnapshotRequest;
use crate::model::InstallSnapshotResponse;
use crate::model::RaftEndpoint;
use crate::model::RaftGroupMembers;
use crate::model::RaftMessage;
use crate::model::SnapshotChunk;
use crate::model::SnapshotEntry;

/// Reassembles a snapshot from chunks pulled off the leader and any
/// peers advertised as holding it. Lives on the installing follower; a
/// newer announced snapshot discards the collector wholesale, partial
/// state is never merged across snapshot indices.
pub(crate) struct SnapshotChunkCollector {
    snapshot_index: u64,
    snapshot_term: u64,
    chunk_count: u64,
    chunks: BTreeMap<u64, SnapshotChunk>,
    group_members: RaftGroupMembers,
    sources: Vec<RaftEndpoint>,
    next_source: usize,
}

impl SnapshotChunkCollector {
    fn new(m: &InstallSnapshotRequest, local: &RaftEndpoint) -> Self {
        let mut collector = Self {
            snapshot_index: m.snapshot_index,
            snapshot_term: m.snapshot_term,
            chunk_count: m.chunk_count,
            chunks: BTreeMap::new(),
            group_members: m.group_members.clone(),
            sources: Vec::new(),
            next_source: 0,
        };
        collector.update_sources(m, local);
        collector
    }

    pub(crate) fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Refreshes the chunk sources from the latest leader announcement.
    fn update_sources(&mut self, m: &InstallSnapshotRequest, local: &RaftEndpoint) {
        let mut sources: BTreeSet<RaftEndpoint> =
            m.snapshotted_members.iter().cloned().collect();
        sources.insert(m.sender.clone());
        sources.remove(local);
        self.sources = sources.into_iter().collect();
    }

    /// Returns true when the chunk was new.
    fn add_chunk(&mut self, chunk: SnapshotChunk) -> bool {
        if chunk.snapshot_index != self.snapshot_index
            || chunk.chunk_index >= self.chunk_count
        {
            return false;
        }
        self.chunks.insert(chunk.chunk_index, chunk).is_none()
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == self.chunk_count
    }

    /// Indices not yet received, capped at one per known source.
    fn chunk_indices_to_request(&self) -> Vec<u64> {
        let cap = self.sources.len().max(1);
        (0..self.chunk_count)
            .filter(|index| !self.chunks.contains_key(index))
            .take(cap)
            .collect()
    }

    fn next_source(&mut self) -> Option<RaftEndpoint> {
        if self.sources.is_empty() {
            return None;
        }
        let source = self.sources[self.next_source % self.sources.len()].clone();
        self.next_source += 1;
        Some(source)
    }

    fn into_snapshot_entry(self) -> SnapshotEntry {
        SnapshotEntry {
            index: self.snapshot_index,
            term: self.snapshot_term,
            group_members: self.group_members,
            chunks: self.chunks.into_values().collect(),
        }
    }
}

impl RaftCore {
    /// Compacts the log once enough entries were applied since the last
    /// snapshot.
    pub(crate) fn maybe_take_snapshot(&mut self) -> Result<()> {
        if self.last_applied - self.log.snapshot_index()
            < self.config.commit_count_to_take_snapshot
        {
            return Ok(());
        }
        let index = self.last_applied;
        let term = self.log.term_of(index)?.ok_or(RaftError::InvalidLogIndex {
            index,
            reason: "applied entry missing while taking snapshot".into(),
        })?;
        let payload = self.state_machine.take_snapshot()?;
        let snapshot = SnapshotEntry::new(
            index,
            term,
            self.committed_members.clone(),
            payload,
            self.config.snapshot_chunk_size_bytes as usize,
        );
        let chunk_count = snapshot.chunk_count();
        self.log
            .install_snapshot(snapshot, self.config.log_tail_to_keep())?;
        info!(node = %self.endpoint, index, chunk_count, "took snapshot");
        if let RaftRole::Leader(state) = &mut self.role {
            // Start over: only members proven to have replicated past the
            // snapshot index are advertised as chunk sources.
            let mut snapshotted = BTreeSet::new();
            snapshotted.insert(self.endpoint.clone());
            for (member, progress) in &state.progress {
                if progress.match_index >= index {
                    snapshotted.insert(member.clone());
                }
            }
            state.snapshotted_members = snapshotted;
        }
        Ok(())
    }

    /// The leader's snapshot message for a follower whose next entry was
    /// compacted away. Carries no chunks; the follower pulls those.
    pub(crate) fn build_snapshot_announcement(
        &mut self,
        target: &RaftEndpoint,
    ) -> Result<RaftMessage> {
        let snapshot = self.log.snapshot()?.ok_or_else(|| {
            RaftError::Fatal("follower behind snapshot index but no snapshot stored".into())
        })?;
        let snapshotted_members = self.advertised_snapshot_sources(target);
        let RaftRole::Leader(state) = &self.role else {
            return Err(RaftError::Fatal("snapshot announcement without leadership".into()));
        };
        let flow_control_seq_no = state
            .progress
            .get(target)
            .map_or(0, |p| p.flow_control_seq_no);
        Ok(RaftMessage::InstallSnapshotRequest(InstallSnapshotRequest {
            group_id: self.group_id.clone(),
            sender: self.endpoint.clone(),
            term: self.term,
            sender_leader: true,
            snapshot_term: snapshot.term,
            snapshot_index: snapshot.index,
            chunk_count: snapshot.chunk_count(),
            chunks: Vec::new(),
            group_members: snapshot.group_members.clone(),
            snapshotted_members,
            query_seq_no: state.query_seq_no,
            flow_control_seq_no,
        }))
    }

    /// Members advertised to `target` as alternative chunk sources:
    /// holders of the current snapshot that responded recently, minus the
    /// target itself. Disabled entirely by configuration.
    fn advertised_snapshot_sources(&self, target: &RaftEndpoint) -> Vec<RaftEndpoint> {
        if !self.config.transfer_snapshots_from_followers {
            return Vec::new();
        }
        let RaftRole::Leader(state) = &self.role else {
            return Vec::new();
        };
        let timeout = self.config.leader_heartbeat_timeout();
        state
            .snapshotted_members
            .iter()
            .filter(|member| {
                if **member == *target {
                    return false;
                }
                if **member == self.endpoint {
                    return true;
                }
                state
                    .progress
                    .get(*member)
                    .is_some_and(|p| p.last_response_at.elapsed() < timeout)
            })
            .cloned()
            .collect()
    }

    pub(crate) fn handle_install_snapshot_request(
        &mut self,
        m: InstallSnapshotRequest,
    ) -> Result<()> {
        if m.sender_leader {
            if m.term < self.term {
                return Ok(());
            }
            self.step_down(m.term, Some(m.sender.clone()))?;
        } else if m.term > self.term {
            self.step_down(m.term, None)?;
        }

        if m.snapshot_index <= self.log.snapshot_index() {
            // Already at or past this snapshot; let the leader resume
            // from the log.
            if m.sender_leader {
                self.send_snapshot_installed_ack(&m.sender, self.log.last_log_index(), &m);
            }
            return Ok(());
        }

        match &self.snapshot_collector {
            Some(collector) if collector.snapshot_index() > m.snapshot_index => {
                debug!(node = %self.endpoint, index = m.snapshot_index, "stale snapshot message");
                return Ok(());
            }
            Some(collector) if collector.snapshot_index() < m.snapshot_index => {
                info!(
                    node = %self.endpoint,
                    old = collector.snapshot_index(),
                    new = m.snapshot_index,
                    "newer snapshot announced, discarding partial chunks"
                );
                self.snapshot_collector = Some(SnapshotChunkCollector::new(&m, &self.endpoint));
            }
            Some(_) => {}
            None => {
                info!(
                    node = %self.endpoint,
                    index = m.snapshot_index,
                    chunks = m.chunk_count,
                    "starting snapshot install"
                );
                self.snapshot_collector = Some(SnapshotChunkCollector::new(&m, &self.endpoint));
            }
        }

        if let Some(collector) = &mut self.snapshot_collector {
            if m.sender_leader {
                collector.update_sources(&m, &self.endpoint);
            }
            for chunk in m.chunks.iter().cloned() {
                collector.add_chunk(chunk);
            }
            if collector.is_complete() {
                return self.finish_snapshot_install(&m);
            }
        }
        self.request_missing_chunks();
        Ok(())
    }

    /// Installs the fully collected snapshot: log, state machine and
    /// membership all jump to the snapshot's position, and the collector
    /// is torn down.
    fn finish_snapshot_install(&mut self, m: &InstallSnapshotRequest) -> Result<()> {
        let Some(collector) = self.snapshot_collector.take() else {
            return Ok(());
        };
        let snapshot = collector.into_snapshot_entry();
        let index = snapshot.index;
        let members = snapshot.group_members.clone();
        let payload = snapshot.payload();
        self.log.install_snapshot(snapshot, 0)?;
        self.state_machine.restore(&payload)?;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        // The snapshot's embedded membership is the committed membership
        // at its index. The local endpoint may legitimately be absent
        // when the snapshot pre-dates its own addition; the entries that
        // follow will re-introduce it.
        self.committed_members = members.clone();
        self.effective_members = members;
        info!(node = %self.endpoint, index, "snapshot installed");
        let ack_target = match &self.leader {
            Some(leader) => leader.clone(),
            None => m.sender.clone(),
        };
        self.send_snapshot_installed_ack(&ack_target, index, m);
        Ok(())
    }

    fn send_snapshot_installed_ack(
        &self,
        target: &RaftEndpoint,
        last_log_index: u64,
        m: &InstallSnapshotRequest,
    ) {
        self.send(
            target,
            RaftMessage::AppendEntriesSuccessResponse(AppendEntriesSuccessResponse {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                last_log_index,
                query_seq_no: m.query_seq_no,
                flow_control_seq_no: m.flow_control_seq_no,
            }),
        );
    }

    /// Asks the next sources, round-robin, for chunks not yet received.
    fn request_missing_chunks(&mut self) {
        let group_id = self.group_id.clone();
        let endpoint = self.endpoint.clone();
        let term = self.term;
        let Some(collector) = &mut self.snapshot_collector else {
            return;
        };
        let mut requests = Vec::new();
        for chunk_index in collector.chunk_indices_to_request() {
            let Some(source) = collector.next_source() else {
                warn!(node = %endpoint, "no sources available for snapshot chunks");
                break;
            };
            requests.push((
                source,
                RaftMessage::InstallSnapshotResponse(InstallSnapshotResponse {
                    group_id: group_id.clone(),
                    sender: endpoint.clone(),
                    term,
                    snapshot_index: collector.snapshot_index(),
                    requested_chunk_index: chunk_index,
                    query_seq_no: 0,
                }),
            ));
        }
        for (source, request) in requests {
            self.send(&source, request);
        }
    }

    /// Serves a chunk request from an installing follower. Any member
    /// holding the matching snapshot answers, not just the leader.
    pub(crate) fn handle_install_snapshot_response(
        &mut self,
        m: InstallSnapshotResponse,
    ) -> Result<()> {
        if m.term > self.term {
            self.step_down(m.term, None)?;
        }
        let Some(snapshot) = self.log.snapshot()? else {
            return Ok(());
        };
        if snapshot.index != m.snapshot_index {
            return Ok(());
        }
        let Some(chunk) = snapshot.chunk(m.requested_chunk_index) else {
            return Ok(());
        };
        let is_leader = matches!(self.role, RaftRole::Leader(_));
        let snapshotted_members = if is_leader {
            self.advertised_snapshot_sources(&m.sender)
        } else {
            Vec::new()
        };
        let query_seq_no = match &self.role {
            RaftRole::Leader(state) => state.query_seq_no,
            _ => 0,
        };
        self.send(
            &m.sender,
            RaftMessage::InstallSnapshotRequest(InstallSnapshotRequest {
                group_id: self.group_id.clone(),
                sender: self.endpoint.clone(),
                term: self.term,
                sender_leader: is_leader,
                snapshot_term: snapshot.term,
                snapshot_index: snapshot.index,
                chunk_count: snapshot.chunk_count(),
                chunks: vec![chunk.clone()],
                group_members: snapshot.group_members.clone(),
                snapshotted_members,
                query_seq_no,
                flow_control_seq_no: 0,
            }),
        );
        Ok(())
    }
}
