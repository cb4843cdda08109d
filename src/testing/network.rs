//! A loopback transport with programmable fault rules: per-edge drops,
//! per-kind drops, and message alteration hooks for protocol-level fault
//! injection.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::model::MessageKind;
use crate::model::RaftEndpoint;
use crate::model::RaftMessage;
use crate::node::RaftNode;
use crate::transport::Transport;

/// An alteration hook for one network edge and message kind. Returning
/// `None` delivers the original message unchanged.
pub type AlterFn = Arc<dyn Fn(&RaftMessage) -> Option<RaftMessage> + Send + Sync>;

type Edge = (RaftEndpoint, RaftEndpoint);

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<RaftEndpoint, RaftNode>,
    dropped_edges: HashSet<Edge>,
    dropped_kinds: HashSet<(RaftEndpoint, RaftEndpoint, MessageKind)>,
    alterations: HashMap<(RaftEndpoint, RaftEndpoint, MessageKind), AlterFn>,
}

/// Shared message fabric for an in-process group. Each node gets its own
/// [`Transport`] handle (carrying the sender identity) from
/// [`LocalNetwork::transport_for`].
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: RaftNode) {
        self.state
            .write()
            .nodes
            .insert(node.endpoint().clone(), node);
    }

    pub fn deregister(&self, endpoint: &RaftEndpoint) {
        self.state.write().nodes.remove(endpoint);
    }

    pub fn transport_for(&self, endpoint: RaftEndpoint) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from: endpoint,
            network: self.clone(),
        })
    }

    /// Drops every message from `from` to `to`.
    pub fn drop_messages(&self, from: &RaftEndpoint, to: &RaftEndpoint) {
        self.state
            .write()
            .dropped_edges
            .insert((from.clone(), to.clone()));
    }

    /// Drops messages of one kind on the `from` -> `to` edge.
    pub fn drop_messages_of_kind(
        &self,
        from: &RaftEndpoint,
        to: &RaftEndpoint,
        kind: MessageKind,
    ) {
        self.state
            .write()
            .dropped_kinds
            .insert((from.clone(), to.clone(), kind));
    }

    /// Installs an alteration hook on the `from` -> `to` edge for one
    /// message kind.
    pub fn alter_messages(
        &self,
        from: &RaftEndpoint,
        to: &RaftEndpoint,
        kind: MessageKind,
        alter: AlterFn,
    ) {
        self.state
            .write()
            .alterations
            .insert((from.clone(), to.clone(), kind), alter);
    }

    /// Removes every rule that involves `endpoint`, in either direction.
    pub fn reset_rules_for(&self, endpoint: &RaftEndpoint) {
        let mut state = self.state.write();
        state
            .dropped_edges
            .retain(|(from, to)| from != endpoint && to != endpoint);
        state
            .dropped_kinds
            .retain(|(from, to, _)| from != endpoint && to != endpoint);
        state
            .alterations
            .retain(|(from, to, _), _| from != endpoint && to != endpoint);
    }

    pub fn reset_all_rules(&self) {
        let mut state = self.state.write();
        state.dropped_edges.clear();
        state.dropped_kinds.clear();
        state.alterations.clear();
    }

    /// Partitions `isolated` away from the rest of the registered nodes,
    /// both directions. Nodes inside `isolated` still reach each other.
    pub fn split(&self, isolated: &[RaftEndpoint]) {
        let mut state = self.state.write();
        let others: Vec<RaftEndpoint> = state
            .nodes
            .keys()
            .filter(|endpoint| !isolated.contains(endpoint))
            .cloned()
            .collect();
        for inside in isolated {
            for outside in &others {
                state.dropped_edges.insert((inside.clone(), outside.clone()));
                state.dropped_edges.insert((outside.clone(), inside.clone()));
            }
        }
    }

    /// Heals every partition created by [`LocalNetwork::split`] or
    /// [`LocalNetwork::drop_messages`].
    pub fn merge(&self) {
        self.state.write().dropped_edges.clear();
    }

    fn deliver(&self, from: &RaftEndpoint, to: &RaftEndpoint, message: RaftMessage) {
        let state = self.state.read();
        if state.dropped_edges.contains(&(from.clone(), to.clone())) {
            trace!(%from, %to, kind = ?message.kind(), "dropping message (edge rule)");
            return;
        }
        let kind = message.kind();
        if state
            .dropped_kinds
            .contains(&(from.clone(), to.clone(), kind))
        {
            trace!(%from, %to, ?kind, "dropping message (kind rule)");
            return;
        }
        let message = match state.alterations.get(&(from.clone(), to.clone(), kind)) {
            Some(alter) => alter(&message).unwrap_or(message),
            None => message,
        };
        if let Some(node) = state.nodes.get(to) {
            node.handle_message(message);
        }
    }
}

struct LocalTransport {
    from: RaftEndpoint,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, target: &RaftEndpoint, message: RaftMessage) {
        self.network.deliver(&self.from, target, message);
    }
}
