//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::BarrierError;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::error::TransferError;
use crate::membership::Configuration;
use crate::membership::ServerRole;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type implements the full Raft protocol with flexible server roles, joint
/// consensus membership changes and leadership transfer, and is the interface to a
/// running Raft node. Applications building on top of Raft will use this to spawn a Raft
/// task and interact with the spawned task.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very
/// cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the
/// Raft node is shutting down (potentially for data safety reasons due to a storage
/// error), and the `shutdown` method should be called on this type to await the shutdown
/// of the node. If the parent application needs to shutdown the Raft node for any reason,
/// calling `shutdown` will do the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and
    /// should be persisted in a well known location, probably alongside the Raft log and
    /// the application's state machine. This ensures that restarts of the node will yield
    /// the same ID every time.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for
    /// sending RPCs to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data
    /// storage.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are
    /// also used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to
    /// gather votes (§5.2), and by peers probing the cluster in a pre-vote round.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow
    /// node up-to-speed with the leader (§7). The installation is acknowledged with an
    /// AppendEntries result naming the snapshot's last covered index.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_last=%rpc.last_term, snapshot_index=%rpc.last_index))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a TimeoutNow RPC to this Raft node, asking it to start an election
    /// immediately as part of a leadership transfer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn timeout_now(&self, rpc: TimeoutNowRequest) -> Result<(), RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::TimeoutNow { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date; however, the `barrier` method must still be used to guard against
    /// stale reads. This method is perfect for making decisions on where to route client
    /// requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine
    /// will be returned as the response from this method.
    ///
    /// Our goal for Raft is to implement linearizable semantics. If the leader crashes
    /// after committing a log entry but before responding to the client, the client may
    /// retry the command with a new leader, causing it to be executed a second time. As
    /// such, clients should assign unique serial numbers to every command, and the state
    /// machine should track the latest serial number processed for each client. The
    /// `RaftStorage::apply_to_state_machine` method is the perfect place to implement
    /// this.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(
        &self,
        rpc: ClientWriteRequest<D>,
    ) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWriteRequest { rpc, tx }, span))
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", err);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Append a barrier entry to the log and wait for it to be applied.
    ///
    /// A barrier linearizes reads: once it resolves, every entry committed before the
    /// barrier was submitted has been applied to the state machine, and this node was the
    /// leader at the barrier's index. Returns the barrier's log index.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn barrier(&self) -> Result<u64, BarrierError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Barrier { tx }, span))
            .map_err(|_| BarrierError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| BarrierError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Initialize a pristine Raft node with the given set of voters.
    ///
    /// This command should be called on pristine nodes — where the log index is 0 and the
    /// `current_term` is 0 — as if either of those constraints are false, it indicates
    /// that the cluster is already formed and in motion. If `InitializeError::NotAllowed`
    /// is returned from this function, it is safe to ignore, as it simply indicates that
    /// the cluster is already up and running, which is ultimately the goal of this
    /// function.
    ///
    /// This command will work for single-node or multi-node cluster formation. This
    /// command should be called with all discovered nodes which need to be part of the
    /// cluster, and as such it is recommended that applications be configured with an
    /// initial cluster formation delay which will allow time for the initial members of
    /// the cluster to be discovered for this call.
    ///
    /// Once a node becomes leader and detects that its index is 0, it will commit a new
    /// config entry (instead of the normal barrier entry created by new leaders).
    ///
    /// Every member of the cluster should perform these actions. This routine is
    /// race-condition free, and Raft guarantees that the first node to become the cluster
    /// leader will propagate only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Initialize { members, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Add a new server to the cluster as an inert spare (§6).
    ///
    /// The new server does not receive entries until it is promoted with `assign_role`.
    /// Returns the log index of the configuration change once it has committed.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn add_server(&self, id: NodeId) -> Result<u64, ResponseError> {
        self.change(RaftMsgFactory::AddServer { id }).await
    }

    /// Assign a new role to a server of the cluster (§6).
    ///
    /// When promoting to a voting role (`Voter` or `Logger`) and the target's log is not
    /// up-to-date, the leader first brings the target up-to-date through bounded catch-up
    /// rounds, then submits the configuration change. Returns the log index of the
    /// configuration change once it has committed.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id, role=%role))]
    pub async fn assign_role(&self, id: NodeId, role: ServerRole) -> Result<u64, ResponseError> {
        self.change(RaftMsgFactory::AssignRole { id, role }).await
    }

    /// Atomically promote one server and remove another through joint consensus (§6).
    ///
    /// The cluster enters the JOINT phase with `id` promoted in the NEW group and
    /// `remove_id` absent from it. Once the joint configuration commits (requiring
    /// majorities in both groups), the leader collapses the configuration back to NORMAL.
    /// Returns the log index of the joint configuration change once it has committed.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id, role=%role, remove=remove_id))]
    pub async fn joint_promote(&self, id: NodeId, role: ServerRole, remove_id: NodeId) -> Result<u64, ResponseError> {
        self.change(RaftMsgFactory::JointPromote { id, role, remove_id }).await
    }

    /// Remove a server from the cluster (§6).
    ///
    /// In the NORMAL phase this emits a NORMAL→NORMAL removal. In the JOINT phase the
    /// configuration collapses back to NORMAL using the group not containing `id`.
    /// Returns the log index of the configuration change once it has committed.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn remove_server(&self, id: NodeId) -> Result<u64, ResponseError> {
        self.change(RaftMsgFactory::RemoveServer { id }).await
    }

    /// Re-append the current configuration as a fresh CHANGE entry.
    ///
    /// Useful to re-anchor the configuration in the log, e.g. after restoring state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn duplicate_configuration(&self) -> Result<u64, ResponseError> {
        self.change(RaftMsgFactory::DuplicateConfiguration).await
    }

    async fn change(&self, factory: RaftMsgFactory) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        let msg = factory.build(tx);
        self.inner
            .tx_api
            .send((msg, span))
            .map_err(|_| ResponseError::ChangeConfig(ChangeConfigError::RaftError(RaftError::ShuttingDown)))?;
        match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!("recv rx error: {}", err);
                Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into())
            }
        }
    }

    /// Transfer leadership to the given voter, or to a suitable up-to-date voter when
    /// `target` is 0.
    ///
    /// The leader stops accepting new client requests, waits for the transferee's log to
    /// be current, then sends it a TimeoutNow RPC. The transferee starts an election with
    /// the disruption-protection override. Resolves with the transferee's ID once this
    /// node observes the new leader, or with `TransferError::Timeout` if the transferee
    /// did not take over within an election timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(target=target))]
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<NodeId, TransferError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::TransferLeadership { target, tx }, span))
            .map_err(|_| TransferError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| TransferError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use flexraft::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait forever for the node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    ///
    /// // wait for this raft node to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type BarrierResponseTx = oneshot::Sender<Result<u64, BarrierError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;
pub(crate) type TransferResponseTx = oneshot::Sender<Result<NodeId, TransferError>>;

/// Helper enum for building admin messages with a shared request path.
enum RaftMsgFactory {
    AddServer { id: NodeId },
    AssignRole { id: NodeId, role: ServerRole },
    JointPromote { id: NodeId, role: ServerRole, remove_id: NodeId },
    RemoveServer { id: NodeId },
    DuplicateConfiguration,
}

impl RaftMsgFactory {
    fn build<D: AppData, R: AppDataResponse>(self, tx: ResponseTx) -> RaftMsg<D, R> {
        match self {
            RaftMsgFactory::AddServer { id } => RaftMsg::AddServer { id, tx },
            RaftMsgFactory::AssignRole { id, role } => RaftMsg::AssignRole { id, role, tx },
            RaftMsgFactory::JointPromote { id, role, remove_id } => RaftMsg::JointPromote { id, role, remove_id, tx },
            RaftMsgFactory::RemoveServer { id } => RaftMsg::RemoveServer { id, tx },
            RaftMsgFactory::DuplicateConfiguration => RaftMsg::DuplicateConfiguration { tx },
        }
    }
}

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
        tx: oneshot::Sender<Result<(), RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    Barrier {
        tx: BarrierResponseTx,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddServer {
        id: NodeId,
        tx: ResponseTx,
    },
    AssignRole {
        id: NodeId,
        role: ServerRole,
        tx: ResponseTx,
    },
    JointPromote {
        id: NodeId,
        role: ServerRole,
        remove_id: NodeId,
        tx: ResponseTx,
    },
    RemoveServer {
        id: NodeId,
        tx: ResponseTx,
    },
    DuplicateConfiguration {
        tx: ResponseTx,
    },
    TransferLeadership {
        target: NodeId,
        tx: TransferResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the log entry immediately preceding the new entries.
    pub prev_log_term: u64,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// A random packet ID, used only for correlating traces across nodes.
    pub pkt: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev={}-{}, leader_commit={}, n={}, pkt={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len(),
            self.pkt,
        )
    }
}

/// The response to an `AppendEntriesRequest`, also used to acknowledge snapshot
/// installations.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// 0 on success; on failure, the `prev_log_index` the request was rejected at, used
    /// by the leader as the hint to rewind `next_index`.
    pub rejected: u64,
    /// The index of the last entry durably stored on the responding node.
    ///
    /// On success the leader advances the peer's match index to this value (clamped by
    /// its own last index); on rejection it bounds how far `next_index` is rewound.
    pub last_log_index: u64,
    /// Echo of the request's packet ID.
    pub pkt: u64,
}

impl MessageSummary for AppendEntriesResponse {
    fn summary(&self) -> String {
        format!(
            "term={}, rejected={}, last_log_index={}, pkt={}",
            self.term, self.rejected, self.last_log_index, self.pkt
        )
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An application command to be applied to the state machine.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// An empty entry used to linearize reads and to anchor a new leader's term.
    Barrier,
    /// A configuration change entry.
    ConfigChange(EntryConfigChange),
}

impl<D: AppData> EntryPayload<D> {
    /// Create a new payload holding an application command.
    pub fn normal(data: D) -> Self {
        EntryPayload::Normal(EntryNormal { data })
    }

    /// Create a new payload holding a configuration.
    pub(crate) fn config_change(configuration: Configuration) -> Self {
        EntryPayload::ConfigChange(EntryConfigChange { configuration })
    }
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::Barrier => "barrier".to_string(),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {}", c.configuration.summary())
            }
        }
    }
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A log entry holding a configuration change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// The cluster's new membership configuration.
    pub configuration: Configuration,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term, or the probed term in a pre-vote round.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
    /// Whether this is a pre-vote probe: neither side persists anything for it.
    pub pre_vote: bool,
    /// Set by a transferee responding to TimeoutNow; overrides disruption protection.
    pub disrupt_leader: bool,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
            pre_vote: false,
            disrupt_leader: false,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
    /// Echo of the request's `pre_vote` flag: a pre-vote grant persists nothing and must
    /// not be counted in a real election.
    pub pre_vote: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to install a snapshot on a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The index of the last entry covered by the snapshot.
    pub last_index: u64,
    /// The term of the last entry covered by the snapshot.
    pub last_term: u64,
    /// The log index at which the snapshot's configuration was appended.
    pub conf_index: u64,
    /// The membership configuration covered by the snapshot.
    pub conf: Configuration,
    /// The serialized state machine.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last={}-{}, conf_index={}, len={}",
            self.term,
            self.leader_id,
            self.last_term,
            self.last_index,
            self.conf_index,
            self.data.len(),
        )
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a leader to its transferee to make it start an election immediately.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// The sending leader's current term.
    pub term: u64,
    /// The sending leader's ID.
    pub leader_id: u64,
    /// The leader's last log index, which the transferee's log must cover.
    pub last_log_index: u64,
    /// The leader's last log term.
    pub last_log_term: u64,
}

impl MessageSummary for TimeoutNowRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then applied to the
/// Raft state machine according to the Raft protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The application specific contents of this client request.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance with a normal entry type.
    pub fn new(entry: D) -> Self {
        Self {
            entry: EntryPayload::normal(entry),
        }
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
