//! Whole-group fixture: builds N nodes over a [`LocalNetwork`], tracks
//! their state machines, and offers the waiting helpers integration
//! tests lean on.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RaftConfig;
use crate::model::RaftEndpoint;
use crate::node::RaftNode;
use crate::node::RaftNodeRole;
use crate::node::RaftNodeStatus;
use crate::storage::InMemoryLogStore;

use super::eventually;
use super::LocalNetwork;
use super::SimpleStateMachine;

pub struct LocalRaftGroup {
    network: LocalNetwork,
    config: RaftConfig,
    group_id: String,
    initial_members: Vec<RaftEndpoint>,
    nodes: Vec<RaftNode>,
    machines: HashMap<RaftEndpoint, SimpleStateMachine>,
    next_node_id: usize,
}

impl LocalRaftGroup {
    /// A group of `size` nodes with the fast test timings. Nodes are
    /// built but not running until [`LocalRaftGroup::start`].
    pub fn new(size: usize) -> Self {
        Self::with_config(size, Self::test_config())
    }

    pub fn with_config(size: usize, config: RaftConfig) -> Self {
        let initial_members: Vec<RaftEndpoint> =
            (1..=size).map(|i| RaftEndpoint::new(format!("n{i}"))).collect();
        let mut group = Self {
            network: LocalNetwork::new(),
            config,
            group_id: "test-group".into(),
            initial_members: initial_members.clone(),
            nodes: Vec::new(),
            machines: HashMap::new(),
            next_node_id: size + 1,
        };
        for endpoint in initial_members {
            let node = group.build_node(endpoint);
            group.nodes.push(node);
        }
        group
    }

    /// Timings compressed enough that elections and heartbeats converge
    /// within a few hundred milliseconds.
    pub fn test_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            leader_heartbeat_period_ms: 25,
            leader_heartbeat_timeout_ms: 300,
            append_entries_request_batch_size: 64,
            commit_count_to_take_snapshot: 50_000,
            max_uncommitted_log_entry_count: 1_000,
            snapshot_chunk_size_bytes: 1_024,
            transfer_snapshots_from_followers: true,
        }
    }

    fn build_node(&mut self, endpoint: RaftEndpoint) -> RaftNode {
        let machine = SimpleStateMachine::new();
        self.machines.insert(endpoint.clone(), machine.clone());
        let node = RaftNode::builder()
            .endpoint(endpoint.clone())
            .group_id(self.group_id.clone())
            .initial_members(self.initial_members.clone())
            .config(self.config.clone())
            .log_store(InMemoryLogStore::new())
            .state_machine(machine)
            .transport(self.network.transport_for(endpoint))
            .build()
            .expect("failed to build test node");
        self.network.register(node.clone());
        node
    }

    /// Spawns every built node. Must run inside a Tokio runtime.
    pub fn start(&self) {
        for node in &self.nodes {
            node.start().expect("failed to start test node");
        }
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn nodes(&self) -> &[RaftNode] {
        &self.nodes
    }

    pub fn node(&self, endpoint: &RaftEndpoint) -> &RaftNode {
        self.nodes
            .iter()
            .find(|node| node.endpoint() == endpoint)
            .expect("no such node in the group")
    }

    pub fn leader(&self) -> Option<RaftNode> {
        self.nodes.iter().find(|node| {
            let report = node.report();
            report.role == RaftNodeRole::Leader && report.status != RaftNodeStatus::Terminated
        }).cloned()
    }

    pub fn followers(&self, leader: &RaftEndpoint) -> Vec<RaftNode> {
        self.nodes
            .iter()
            .filter(|node| {
                node.endpoint() != leader
                    && node.report().status != RaftNodeStatus::Terminated
            })
            .cloned()
            .collect()
    }

    pub fn state_machine(&self, endpoint: &RaftEndpoint) -> SimpleStateMachine {
        self.machines
            .get(endpoint)
            .expect("no state machine for endpoint")
            .clone()
    }

    /// Waits until some node reports itself leader and returns it.
    pub async fn wait_until_leader_elected(&self) -> RaftNode {
        eventually(Duration::from_secs(10), || self.leader().is_some()).await;
        self.leader().expect("leader gone right after election")
    }

    /// Stops a node and removes it from the fabric, simulating a crash.
    pub fn terminate_node(&mut self, endpoint: &RaftEndpoint) {
        if let Some(position) = self
            .nodes
            .iter()
            .position(|node| node.endpoint() == endpoint)
        {
            let node = self.nodes.remove(position);
            node.terminate();
        }
        self.network.deregister(endpoint);
        self.network.reset_rules_for(endpoint);
    }

    /// Builds and starts a fresh node with a generated endpoint. The new
    /// node is constructed with the group's original membership and
    /// learns the current one from the leader; add it to the group with
    /// `change_membership` separately.
    pub fn create_new_node(&mut self) -> RaftNode {
        let endpoint = RaftEndpoint::new(format!("n{}", self.next_node_id));
        self.next_node_id += 1;
        let node = self.build_node(endpoint);
        node.start().expect("failed to start new test node");
        self.nodes.push(node.clone());
        node
    }

    /// Terminates every node in the group.
    pub fn destroy(&self) {
        for node in &self.nodes {
            node.terminate();
        }
    }
}
