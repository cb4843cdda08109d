use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Opaque, comparable identity of a Raft group member.
///
/// Endpoints are supplied at node construction and only change through
/// committed membership updates. The engine never interprets the id; the
/// transport collaborator resolves it to an actual address.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaftEndpoint {
    id: String,
}

impl RaftEndpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RaftEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for RaftEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaftEndpoint({})", self.id)
    }
}

impl From<&str> for RaftEndpoint {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
