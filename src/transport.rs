//! Outbound message seam. The engine is transport-agnostic: it hands
//! fully-formed messages to a [`Transport`] and never waits for delivery.
//! Responses come back through the node's inbound message path.

#[cfg(test)]
use mockall::automock;

use crate::model::RaftEndpoint;
use crate::model::RaftMessage;

/// Fire-and-forget delivery to a peer. Implementations must not block the
/// caller; loss, duplication and reordering are tolerated by the protocol.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    fn send(&self, target: &RaftEndpoint, message: RaftMessage);
}
