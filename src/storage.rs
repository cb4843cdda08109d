//! Persistence seams of the engine. [`LogStore`] owns the durable log,
//! snapshot and vote record; [`StateMachine`] owns the replicated
//! application state. Both are driven from the node's single event loop,
//! so the contracts are synchronous.

use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

use crate::errors::StorageError;
use crate::model::HardState;
use crate::model::LogEntry;
use crate::model::SnapshotEntry;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable storage for log entries, the latest snapshot and the node's
/// term/vote record. Implementations must persist `append`, `truncate_*`
/// and `persist_hard_state` effects before returning.
#[cfg_attr(test, automock)]
pub trait LogStore: Send + 'static {
    /// Appends entries after the current last index. Indices must be
    /// contiguous; the store does not re-check them.
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Drops every entry with index >= `index`.
    fn truncate_from(&mut self, index: u64) -> StorageResult<()>;

    /// Drops every entry with index <= `index`. Used after a snapshot is
    /// installed to reclaim the covered prefix.
    fn truncate_until(&mut self, index: u64) -> StorageResult<()>;

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>>;

    /// The entry with the highest index still in the store.
    fn last_entry(&self) -> StorageResult<Option<LogEntry>>;

    /// Entries in `[from, to]`, in index order. Missing indices in the
    /// range are an error.
    fn entries(&self, from: u64, to: u64) -> StorageResult<Vec<LogEntry>>;

    /// Replaces the stored snapshot. Log truncation is the caller's job.
    fn install_snapshot(&mut self, snapshot: SnapshotEntry) -> StorageResult<()>;

    fn snapshot(&self) -> StorageResult<Option<SnapshotEntry>>;

    fn persist_hard_state(&mut self, state: &HardState) -> StorageResult<()>;

    fn load_hard_state(&self) -> StorageResult<Option<HardState>>;
}

/// The replicated application. `apply` must be deterministic; snapshots
/// must capture everything `apply` can observe.
#[cfg_attr(test, automock)]
pub trait StateMachine: Send + 'static {
    /// Applies a committed command and returns its result, which the
    /// leader hands back to the caller that replicated it.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;

    /// Runs a read-only command against the current state. Queries never
    /// enter the log.
    fn query(&self, command: &[u8]) -> Vec<u8>;

    fn take_snapshot(&self) -> StorageResult<Vec<u8>>;

    /// Replaces the whole state with a snapshot payload.
    fn restore(&mut self, payload: &[u8]) -> StorageResult<()>;
}

/// Volatile [`LogStore`] used by the in-process test harness and as a
/// starting point for embedders that bring their own durability.
#[derive(Default)]
pub struct InMemoryLogStore {
    entries: BTreeMap<u64, LogEntry>,
    snapshot: Option<SnapshotEntry>,
    hard_state: Option<HardState>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl LogStore for InMemoryLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        for entry in entries {
            self.entries.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> StorageResult<()> {
        self.entries.split_off(&index);
        Ok(())
    }

    fn truncate_until(&mut self, index: u64) -> StorageResult<()> {
        self.entries = self.entries.split_off(&(index + 1));
        Ok(())
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        Ok(self.entries.get(&index).cloned())
    }

    fn last_entry(&self) -> StorageResult<Option<LogEntry>> {
        Ok(self.entries.values().next_back().cloned())
    }

    fn entries(&self, from: u64, to: u64) -> StorageResult<Vec<LogEntry>> {
        let mut out = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for index in from..=to {
            match self.entries.get(&index) {
                Some(entry) => out.push(entry.clone()),
                None => {
                    return Err(StorageError::LogStore(format!(
                        "missing log entry at index {index}"
                    )))
                }
            }
        }
        Ok(out)
    }

    fn install_snapshot(&mut self, snapshot: SnapshotEntry) -> StorageResult<()> {
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn snapshot(&self) -> StorageResult<Option<SnapshotEntry>> {
        Ok(self.snapshot.clone())
    }

    fn persist_hard_state(&mut self, state: &HardState) -> StorageResult<()> {
        self.hard_state = Some(state.clone());
        Ok(())
    }

    fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        Ok(self.hard_state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            operation: Operation::Command(vec![index as u8]),
        }
    }

    #[test]
    fn append_and_read_back() {
        let mut store = InMemoryLogStore::new();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(store.entry(2).unwrap().unwrap().term, 1);
        assert_eq!(store.entries(1, 3).unwrap().len(), 3);
        assert!(store.entry(4).unwrap().is_none());
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut store = InMemoryLogStore::new();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        store.truncate_from(2).unwrap();
        assert_eq!(store.entry_count(), 1);
        assert!(store.entry(2).unwrap().is_none());
        assert!(store.entry(1).unwrap().is_some());
    }

    #[test]
    fn truncate_until_drops_prefix() {
        let mut store = InMemoryLogStore::new();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        store.truncate_until(2).unwrap();
        assert_eq!(store.entry_count(), 1);
        assert!(store.entry(3).unwrap().is_some());
    }

    #[test]
    fn entries_with_gap_is_an_error() {
        let mut store = InMemoryLogStore::new();
        store.append(&[entry(1, 1), entry(3, 1)]).unwrap();
        assert!(store.entries(1, 3).is_err());
    }
}
