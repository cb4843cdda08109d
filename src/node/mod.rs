//! Public surface of the engine: [`RaftNodeBuilder`] wires the
//! collaborators together, [`RaftNode`] is the cheap-to-clone handle
//! through which clients and the transport talk to the consensus actor.

use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::RaftConfig;
use crate::core::RaftCore;
use crate::core::RaftEvent;
use crate::errors::RaftError;
use crate::errors::Result;
use crate::model::MembershipChangeMode;
use crate::model::Operation;
use crate::model::Ordered;
use crate::model::RaftEndpoint;
use crate::model::RaftGroupMembers;
use crate::model::RaftGroupTerm;
use crate::model::RaftMessage;
use crate::raft_log::RaftLog;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::transport::Transport;

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftNodeRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftNodeStatus {
    /// Serving normally.
    Active,
    /// A membership change is appended but not yet committed.
    UpdatingMembers,
    /// Shut down, removed from the group, or the group was terminated.
    Terminated,
}

/// Consistency level of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPolicy {
    /// Executed on the leader after a quorum round proves it is still
    /// leader; reflects every write committed before the query arrived.
    Linearizable,
    /// Executed on the leader's local state without a quorum round; may
    /// briefly serve stale reads from a deposed leader.
    LeaderLocal,
    /// Executed on the local state of any node, leader or not.
    Eventual,
}

/// A point-in-time view of a node's consensus state, refreshed by the
/// actor after every event.
#[derive(Clone, Debug)]
pub struct RaftNodeReport {
    pub endpoint: RaftEndpoint,
    pub group_id: String,
    pub role: RaftNodeRole,
    pub status: RaftNodeStatus,
    pub term: RaftGroupTerm,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub committed_members: RaftGroupMembers,
    pub effective_members: RaftGroupMembers,
    /// True while a snapshot is being collected chunk by chunk.
    pub installing_snapshot: bool,
}

struct NodeInner {
    endpoint: RaftEndpoint,
    group_id: String,
    event_tx: mpsc::Sender<RaftEvent>,
    shutdown_tx: watch::Sender<bool>,
    report: Arc<RwLock<RaftNodeReport>>,
    core: Mutex<Option<RaftCore>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a single Raft group member. Cloning is cheap; all clones
/// talk to the same underlying actor.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<NodeInner>,
}

impl RaftNode {
    pub fn builder() -> RaftNodeBuilder {
        RaftNodeBuilder::default()
    }

    pub fn endpoint(&self) -> &RaftEndpoint {
        &self.inner.endpoint
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Spawns the consensus actor. Must be called exactly once, from
    /// within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let Some(core) = self.inner.core.lock().take() else {
            return Err(RaftError::Fatal("raft node already started".into()));
        };
        let task = tokio::spawn(core.run());
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    /// Replicates an opaque command and resolves once it is committed and
    /// applied, with the result the state machine produced for it.
    pub async fn replicate(&self, command: Vec<u8>) -> Result<Ordered<Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(RaftEvent::Replicate {
            operation: Operation::Command(command),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RaftError::Terminated)?
    }

    /// Runs a read-only command under the requested consistency policy.
    pub async fn query(&self, command: Vec<u8>, policy: QueryPolicy) -> Result<Ordered<Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(RaftEvent::Query {
            command,
            policy,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RaftError::Terminated)?
    }

    /// Adds or removes a single member. `expected_members_log_index` must
    /// equal the log index of the currently committed membership, which
    /// guards against concurrent reconfigurations.
    pub async fn change_membership(
        &self,
        endpoint: RaftEndpoint,
        mode: MembershipChangeMode,
        expected_members_log_index: u64,
    ) -> Result<Ordered<RaftGroupMembers>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(RaftEvent::ChangeMembership {
            endpoint,
            mode,
            expected_members_log_index,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RaftError::Terminated)?
    }

    /// Hands leadership to `target` once it is fully caught up. New
    /// replicates are rejected while the transfer is in progress.
    pub async fn transfer_leadership(&self, target: RaftEndpoint) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(RaftEvent::TransferLeadership {
            target,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RaftError::Terminated)?
    }

    /// Replicates the group-termination operation; every member shuts
    /// itself down when it commits.
    pub async fn terminate_group(&self) -> Result<Ordered<Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(RaftEvent::Replicate {
            operation: Operation::TerminateGroup,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RaftError::Terminated)?
    }

    /// Shuts this node down. Pending operations fail with
    /// [`RaftError::Terminated`].
    pub fn terminate(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Delivers an inbound message from the transport to the actor.
    /// Messages are dropped when the node is overloaded or gone; the
    /// protocol tolerates loss.
    pub fn handle_message(&self, message: RaftMessage) {
        if let Err(e) = self.inner.event_tx.try_send(RaftEvent::Message(message)) {
            warn!(node = %self.inner.endpoint, error = %e, "dropping inbound message");
        }
    }

    /// Current consensus state of the node. Never blocks on the actor.
    pub fn report(&self) -> RaftNodeReport {
        self.inner.report.read().clone()
    }

    async fn submit(&self, event: RaftEvent) -> Result<()> {
        self.inner
            .event_tx
            .send(event)
            .await
            .map_err(|_| RaftError::Terminated)
    }
}

pub struct RaftNodeBuilder {
    endpoint: Option<RaftEndpoint>,
    group_id: String,
    initial_members: Vec<RaftEndpoint>,
    config: RaftConfig,
    log_store: Option<Box<dyn LogStore>>,
    state_machine: Option<Box<dyn StateMachine>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for RaftNodeBuilder {
    fn default() -> Self {
        Self {
            endpoint: None,
            group_id: "default".into(),
            initial_members: Vec::new(),
            config: RaftConfig::default(),
            log_store: None,
            state_machine: None,
            transport: None,
        }
    }
}

impl RaftNodeBuilder {
    pub fn endpoint(mut self, endpoint: RaftEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// The bootstrap membership of the group. A node added to a running
    /// group later is still constructed with the group's original
    /// members; it learns the current membership from the log or a
    /// snapshot.
    pub fn initial_members(
        mut self,
        members: impl IntoIterator<Item = RaftEndpoint>,
    ) -> Self {
        self.initial_members = members.into_iter().collect();
        self
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn log_store(mut self, log_store: impl LogStore) -> Self {
        self.log_store = Some(Box::new(log_store));
        self
    }

    pub fn state_machine(mut self, state_machine: impl StateMachine) -> Self {
        self.state_machine = Some(Box::new(state_machine));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<RaftNode> {
        self.config.validate()?;
        let endpoint = self
            .endpoint
            .ok_or_else(|| RaftError::Fatal("endpoint is required".into()))?;
        let log_store = self
            .log_store
            .ok_or_else(|| RaftError::Fatal("log store is required".into()))?;
        let state_machine = self
            .state_machine
            .ok_or_else(|| RaftError::Fatal("state machine is required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| RaftError::Fatal("transport is required".into()))?;
        if self.initial_members.is_empty() {
            return Err(RaftError::Fatal("initial members are required".into()));
        }

        let members = RaftGroupMembers::initial(self.initial_members);
        let report = Arc::new(RwLock::new(RaftNodeReport {
            endpoint: endpoint.clone(),
            group_id: self.group_id.clone(),
            role: RaftNodeRole::Follower,
            status: RaftNodeStatus::Active,
            term: RaftGroupTerm {
                term: 0,
                leader: None,
            },
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            snapshot_index: 0,
            committed_members: members.clone(),
            effective_members: members.clone(),
            installing_snapshot: false,
        }));
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = RaftCore::new(
            endpoint.clone(),
            self.group_id.clone(),
            self.config,
            RaftLog::new(log_store)?,
            state_machine,
            transport,
            members,
            event_rx,
            shutdown_rx,
            report.clone(),
        )?;
        Ok(RaftNode {
            inner: Arc::new(NodeInner {
                endpoint,
                group_id: self.group_id,
                event_tx,
                shutdown_tx,
                report,
                core: Mutex::new(Some(core)),
                task: Mutex::new(None),
            }),
        })
    }
}
