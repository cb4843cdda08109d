//! [`RaftLog`] wraps a [`LogStore`] with the cached boundary indices the
//! consensus code consults on every message: last log index/term and the
//! snapshot index/term. The snapshot counts as a virtual log position, so
//! "last log index" never goes backwards when the log prefix is reclaimed.

use tracing::debug;

use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::HardState;
use crate::model::LogEntry;
use crate::model::SnapshotEntry;
use crate::storage::LogStore;

pub struct RaftLog {
    store: Box<dyn LogStore>,
    last_log_index: u64,
    last_log_term: u64,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    /// Builds the cache from whatever the store already holds, so a node
    /// restarted on durable storage resumes where it left off.
    pub fn new(store: Box<dyn LogStore>) -> Result<Self> {
        let (snapshot_index, snapshot_term) = match store.snapshot()? {
            Some(snapshot) => (snapshot.index, snapshot.term),
            None => (0, 0),
        };
        let (last_log_index, last_log_term) = match store.last_entry()? {
            Some(entry) => (entry.index, entry.term),
            None => (snapshot_index, snapshot_term),
        };
        Ok(Self {
            store,
            last_log_index,
            last_log_term,
            snapshot_index,
            snapshot_term,
        })
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Term of the entry at `index`, treating the snapshot boundary as a
    /// readable position. `None` when the index is beyond the log or
    /// already reclaimed below the snapshot.
    pub fn term_of(&self, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        Ok(self.store.entry(index)?.map(|e| e.term))
    }

    pub fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.store.entry(index)?)
    }

    /// Entries in `[from, to]`. The range must lie strictly above the
    /// snapshot index and at or below the last log index.
    pub fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        if from <= self.snapshot_index {
            return Err(RaftError::InvalidLogIndex {
                index: from,
                reason: "range starts at or below the snapshot index".into(),
            });
        }
        if to > self.last_log_index {
            return Err(RaftError::InvalidLogIndex {
                index: to,
                reason: "range ends beyond the last log index".into(),
            });
        }
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.store.entries(from, to)?)
    }

    /// Appends a contiguous batch starting at `last_log_index + 1`.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.last_log_index + 1 {
            return Err(RaftError::InvalidLogIndex {
                index: first.index,
                reason: format!("append must start at {}", self.last_log_index + 1),
            });
        }
        self.store.append(entries)?;
        let last = entries.last().unwrap_or(first);
        self.last_log_index = last.index;
        self.last_log_term = last.term;
        Ok(())
    }

    /// Drops every entry with index >= `index` and returns the truncated
    /// entries so the caller can fail any attached completions.
    pub fn truncate_from(&mut self, index: u64) -> Result<Vec<LogEntry>> {
        if index <= self.snapshot_index {
            return Err(RaftError::InvalidLogIndex {
                index,
                reason: "cannot truncate at or below the snapshot index".into(),
            });
        }
        let truncated = if index <= self.last_log_index {
            self.store.entries(index, self.last_log_index)?
        } else {
            Vec::new()
        };
        self.store.truncate_from(index)?;
        self.last_log_index = index.saturating_sub(1).max(self.snapshot_index);
        self.last_log_term = match self.term_of(self.last_log_index)? {
            Some(term) => term,
            None => self.snapshot_term,
        };
        debug!(from = index, count = truncated.len(), "truncated log suffix");
        Ok(truncated)
    }

    /// Installs a snapshot and reclaims the covered log prefix, keeping a
    /// tail of `keep_tail` entries behind the snapshot so slightly lagging
    /// followers can still be repaired from the log.
    pub fn install_snapshot(&mut self, snapshot: SnapshotEntry, keep_tail: u64) -> Result<()> {
        if snapshot.index <= self.snapshot_index {
            return Err(RaftError::InvalidLogIndex {
                index: snapshot.index,
                reason: "snapshot does not advance the snapshot index".into(),
            });
        }
        self.snapshot_index = snapshot.index;
        self.snapshot_term = snapshot.term;
        if snapshot.index > self.last_log_index {
            // Remote snapshot ahead of our log: the whole log is stale.
            self.store.truncate_from(0)?;
            self.last_log_index = snapshot.index;
            self.last_log_term = snapshot.term;
        } else {
            self.store
                .truncate_until(snapshot.index.saturating_sub(keep_tail))?;
        }
        self.store.install_snapshot(snapshot)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Option<SnapshotEntry>> {
        Ok(self.store.snapshot()?)
    }

    pub fn persist_hard_state(&mut self, state: &HardState) -> Result<()> {
        Ok(self.store.persist_hard_state(state)?)
    }

    pub fn load_hard_state(&self) -> Result<Option<HardState>> {
        Ok(self.store.load_hard_state()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;
    use crate::model::RaftEndpoint;
    use crate::model::RaftGroupMembers;
    use crate::storage::InMemoryLogStore;

    fn log_with(entries: &[(u64, u64)]) -> RaftLog {
        let mut log = RaftLog::new(Box::new(InMemoryLogStore::new())).unwrap();
        let entries: Vec<LogEntry> = entries
            .iter()
            .map(|&(index, term)| LogEntry {
                index,
                term,
                operation: Operation::Command(vec![]),
            })
            .collect();
        log.append(&entries).unwrap();
        log
    }

    fn snapshot_at(index: u64, term: u64) -> SnapshotEntry {
        let members = RaftGroupMembers::initial([RaftEndpoint::new("n1")]);
        SnapshotEntry::new(index, term, members, Vec::new(), 1024)
    }

    #[test]
    fn empty_log_boundaries() {
        let log = RaftLog::new(Box::new(InMemoryLogStore::new())).unwrap();
        assert_eq!(log.last_log_index(), 0);
        assert_eq!(log.last_log_term(), 0);
        assert_eq!(log.term_of(0).unwrap(), Some(0));
    }

    #[test]
    fn append_must_be_contiguous() {
        let mut log = log_with(&[(1, 1), (2, 1)]);
        let gap = LogEntry {
            index: 4,
            term: 1,
            operation: Operation::Command(vec![]),
        };
        assert!(log.append(&[gap]).is_err());
        assert_eq!(log.last_log_index(), 2);
    }

    #[test]
    fn truncate_returns_dropped_entries_and_restores_boundary() {
        let mut log = log_with(&[(1, 1), (2, 1), (3, 2), (4, 2)]);
        let dropped = log.truncate_from(3).unwrap();
        assert_eq!(dropped.len(), 2);
        assert_eq!(log.last_log_index(), 2);
        assert_eq!(log.last_log_term(), 1);
    }

    #[test]
    fn snapshot_counts_as_log_position() {
        let mut log = log_with(&[(1, 1), (2, 1), (3, 1)]);
        log.install_snapshot(snapshot_at(3, 1), 0).unwrap();
        assert_eq!(log.last_log_index(), 3);
        assert_eq!(log.term_of(3).unwrap(), Some(1));
        assert!(log.entry(1).unwrap().is_none());
    }

    #[test]
    fn install_keeps_requested_tail() {
        let mut log = log_with(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]);
        log.install_snapshot(snapshot_at(4, 1), 2).unwrap();
        assert!(log.entry(2).unwrap().is_none());
        assert!(log.entry(3).unwrap().is_some());
        assert!(log.entry(5).unwrap().is_some());
        assert_eq!(log.last_log_index(), 5);
    }

    #[test]
    fn remote_snapshot_ahead_of_log_clears_it() {
        let mut log = log_with(&[(1, 1), (2, 1)]);
        log.install_snapshot(snapshot_at(10, 3), 0).unwrap();
        assert_eq!(log.last_log_index(), 10);
        assert_eq!(log.last_log_term(), 3);
        assert!(log.entry(1).unwrap().is_none());
    }

    #[test]
    fn install_snapshot_reclaims_prefix_in_store() {
        use mockall::predicate::eq;

        use crate::storage::MockLogStore;

        let mut store = MockLogStore::new();
        store.expect_snapshot().returning(|| Ok(None));
        store.expect_last_entry().returning(|| {
            Ok(Some(LogEntry {
                index: 5,
                term: 1,
                operation: Operation::Command(vec![]),
            }))
        });
        store
            .expect_truncate_until()
            .with(eq(2))
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_install_snapshot()
            .times(1)
            .returning(|_| Ok(()));

        let mut log = RaftLog::new(Box::new(store)).unwrap();
        log.install_snapshot(snapshot_at(4, 1), 2).unwrap();
        assert_eq!(log.snapshot_index(), 4);
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let mut log = log_with(&[(1, 1), (2, 1), (3, 1)]);
        log.install_snapshot(snapshot_at(3, 1), 0).unwrap();
        assert!(log.install_snapshot(snapshot_at(2, 1), 0).is_err());
    }
}
