use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::RaftEndpoint;

/// A membership snapshot of the Raft group: the ordered set of member
/// endpoints and the log index at which this membership became effective.
///
/// Exactly one membership is effective at any log position. A pending
/// (uncommitted) membership may exist ahead of the committed one, but never
/// more than one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftGroupMembers {
    members: BTreeSet<RaftEndpoint>,
    log_index: u64,
}

impl RaftGroupMembers {
    /// The initial membership of a freshly bootstrapped group, effective
    /// from log index 0.
    pub fn initial(members: impl IntoIterator<Item = RaftEndpoint>) -> Self {
        Self {
            members: members.into_iter().collect(),
            log_index: 0,
        }
    }

    pub fn members(&self) -> &BTreeSet<RaftEndpoint> {
        &self.members
    }

    /// Log index at which this membership took effect.
    pub fn log_index(&self) -> u64 {
        self.log_index
    }

    pub fn contains(&self, endpoint: &RaftEndpoint) -> bool {
        self.members.contains(endpoint)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Majority size of this membership: more than half of the members.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Derives the membership resulting from applying a single change at
    /// `log_index`.
    pub fn apply(&self, op: &UpdateGroupMembersOp, log_index: u64) -> Result<Self> {
        let mut members = self.members.clone();
        match op.mode {
            MembershipChangeMode::Add => {
                if !members.insert(op.endpoint.clone()) {
                    return Err(RaftError::InvalidMembershipChange(format!(
                        "{} is already a member",
                        op.endpoint
                    )));
                }
            }
            MembershipChangeMode::Remove => {
                if !members.remove(&op.endpoint) {
                    return Err(RaftError::InvalidMembershipChange(format!(
                        "{} is not a member",
                        op.endpoint
                    )));
                }
            }
        }
        Ok(Self { members, log_index })
    }
}

impl fmt::Display for RaftGroupMembers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "}}@{}", self.log_index)
    }
}

/// The one-change-at-a-time reconfiguration payload carried in a log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateGroupMembersOp {
    pub endpoint: RaftEndpoint,
    pub mode: MembershipChangeMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChangeMode {
    Add,
    Remove,
}

/// Leadership state of the group in a given term, as observed by one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftGroupTerm {
    pub term: u64,
    pub leader: Option<RaftEndpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(ids: &[&str]) -> Vec<RaftEndpoint> {
        ids.iter().map(|id| RaftEndpoint::new(*id)).collect()
    }

    #[test]
    fn majority_is_strictly_more_than_half() {
        for (count, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            let ids: Vec<String> = (0..count).map(|i| format!("n{i}")).collect();
            let members =
                RaftGroupMembers::initial(ids.iter().map(RaftEndpoint::new));
            assert_eq!(members.majority(), expected, "count={count}");
        }
    }

    #[test]
    fn apply_add_and_remove() {
        let members = RaftGroupMembers::initial(endpoints(&["a", "b", "c"]));

        let added = members
            .apply(
                &UpdateGroupMembersOp {
                    endpoint: RaftEndpoint::new("d"),
                    mode: MembershipChangeMode::Add,
                },
                7,
            )
            .unwrap();
        assert_eq!(added.member_count(), 4);
        assert_eq!(added.log_index(), 7);

        let removed = added
            .apply(
                &UpdateGroupMembersOp {
                    endpoint: RaftEndpoint::new("a"),
                    mode: MembershipChangeMode::Remove,
                },
                9,
            )
            .unwrap();
        assert!(!removed.contains(&RaftEndpoint::new("a")));
        assert_eq!(removed.member_count(), 3);
    }

    #[test]
    fn apply_rejects_duplicate_add_and_unknown_remove() {
        let members = RaftGroupMembers::initial(endpoints(&["a", "b", "c"]));

        let dup = members.apply(
            &UpdateGroupMembersOp {
                endpoint: RaftEndpoint::new("a"),
                mode: MembershipChangeMode::Add,
            },
            4,
        );
        assert!(matches!(dup, Err(RaftError::InvalidMembershipChange(_))));

        let unknown = members.apply(
            &UpdateGroupMembersOp {
                endpoint: RaftEndpoint::new("x"),
                mode: MembershipChangeMode::Remove,
            },
            4,
        );
        assert!(matches!(unknown, Err(RaftError::InvalidMembershipChange(_))));
    }
}
