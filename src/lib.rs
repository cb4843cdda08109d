//! A single-group Raft consensus engine with pluggable storage, state
//! machine and transport. Build a [`RaftNode`] per member, feed inbound
//! messages to [`RaftNode::handle_message`], and drive the group through
//! `replicate`, `query` and `change_membership`.

mod config;
mod core;
mod errors;
mod model;
mod node;
mod raft_log;
mod storage;
mod transport;

pub use config::*;
pub use errors::*;
pub use model::*;
pub use node::*;
pub use raft_log::RaftLog;
pub use storage::*;
pub use transport::*;

pub mod testing;
