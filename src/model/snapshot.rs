use serde::Deserialize;
use serde::Serialize;

use crate::model::RaftGroupMembers;

/// A compacted representation of all log entries up to `index`: "entries
/// `1..=index` have been folded into this state machine image".
///
/// Index 0 means "no snapshot yet". An install is only accepted when the
/// incoming snapshot is strictly newer than the current one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub index: u64,
    pub term: u64,
    /// Membership committed as of `index`, embedded so a follower that
    /// installs the snapshot also adopts the right group configuration.
    pub group_members: RaftGroupMembers,
    pub chunks: Vec<SnapshotChunk>,
}

impl SnapshotEntry {
    /// Splits a state machine image into transfer chunks. Always produces
    /// at least one chunk so chunk bookkeeping stays uniform for empty
    /// state machines.
    pub fn new(
        index: u64,
        term: u64,
        group_members: RaftGroupMembers,
        payload: Vec<u8>,
        chunk_size: usize,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut payloads: Vec<Vec<u8>> = payload
            .chunks(chunk_size)
            .map(|fragment| fragment.to_vec())
            .collect();
        if payloads.is_empty() {
            payloads.push(Vec::new());
        }

        let chunk_count = payloads.len() as u64;
        let chunks = payloads
            .into_iter()
            .enumerate()
            .map(|(chunk_index, payload)| SnapshotChunk {
                snapshot_index: index,
                snapshot_term: term,
                chunk_index: chunk_index as u64,
                chunk_count,
                payload,
            })
            .collect();

        Self {
            index,
            term,
            group_members,
            chunks,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn chunk(&self, chunk_index: u64) -> Option<&SnapshotChunk> {
        self.chunks.get(chunk_index as usize)
    }

    /// Reassembled state machine image.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for chunk in &self.chunks {
            payload.extend_from_slice(&chunk.payload);
        }
        payload
    }
}

/// One fragment of a snapshot transfer, keyed by the snapshot position it
/// belongs to. Transient: consumed by the receiving chunk collector and
/// discarded once the snapshot is reassembled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub chunk_index: u64,
    pub chunk_count: u64,
    pub payload: Vec<u8>,
}

impl SnapshotChunk {
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 == self.chunk_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RaftEndpoint;

    fn members() -> RaftGroupMembers {
        RaftGroupMembers::initial([RaftEndpoint::new("a"), RaftEndpoint::new("b")])
    }

    #[test]
    fn chunking_round_trips_payload() {
        let payload: Vec<u8> = (0..=255).collect();
        let snapshot = SnapshotEntry::new(10, 2, members(), payload.clone(), 100);
        assert_eq!(snapshot.chunk_count(), 3);
        assert!(snapshot.chunk(2).unwrap().is_last());
        assert_eq!(snapshot.payload(), payload);
    }

    #[test]
    fn empty_payload_still_has_one_chunk() {
        let snapshot = SnapshotEntry::new(5, 1, members(), Vec::new(), 1024);
        assert_eq!(snapshot.chunk_count(), 1);
        assert!(snapshot.chunk(0).unwrap().is_last());
        assert!(snapshot.payload().is_empty());
    }
}
