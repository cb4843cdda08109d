use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::StorageError;
use crate::storage::StateMachine;
use crate::storage::StorageResult;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AppliedCommands {
    commands: Vec<(u64, Vec<u8>)>,
}

/// A state machine that just records every applied command with its log
/// index. `apply` echoes the command back as its result; `query` returns
/// the most recently applied command. Clones share state, so tests keep a
/// clone while the node owns another.
#[derive(Clone, Default)]
pub struct SimpleStateMachine {
    state: Arc<RwLock<AppliedCommands>>,
}

impl SimpleStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every applied command, in application order.
    pub fn applied(&self) -> Vec<Vec<u8>> {
        self.state
            .read()
            .commands
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn applied_count(&self) -> usize {
        self.state.read().commands.len()
    }

    pub fn last_applied_index(&self) -> Option<u64> {
        self.state.read().commands.last().map(|(index, _)| *index)
    }
}

impl StateMachine for SimpleStateMachine {
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8> {
        self.state.write().commands.push((index, command.to_vec()));
        command.to_vec()
    }

    fn query(&self, _command: &[u8]) -> Vec<u8> {
        self.state
            .read()
            .commands
            .last()
            .map(|(_, command)| command.clone())
            .unwrap_or_default()
    }

    fn take_snapshot(&self) -> StorageResult<Vec<u8>> {
        bincode::serialize(&*self.state.read()).map_err(StorageError::Codec)
    }

    fn restore(&mut self, payload: &[u8]) -> StorageResult<()> {
        *self.state.write() = bincode::deserialize(payload).map_err(StorageError::Codec)?;
        Ok(())
    }
}
