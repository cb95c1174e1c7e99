//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::BarrierError;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::TransferError;
use crate::log::RaftLog;
use crate::membership::Configuration;
use crate::membership::Group;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::progress::ProgressSet;
use crate::raft::BarrierResponseTx;
use crate::raft::ClientWriteResponseTx;
use crate::raft::ClientWriteResponse;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::raft::ResponseTx;
use crate::raft::TransferResponseTx;
use crate::core::replication::ReplicaEvent;
use crate::registry::RequestRegistry;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

/// The core type implementing the Raft protocol.
///
/// The core is strictly single-owner: one spawned task owns all node state and drives
/// the role loops. Inbound RPCs, timers and I/O completions are all funneled onto this
/// task, so every state mutation is a plain method call and the node needs no locks.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    ///
    /// This is the effective configuration: an uncommitted CHANGE entry takes effect as
    /// soon as it is appended.
    configuration: Configuration,
    /// The latest committed configuration, kept for rolling back uncommitted changes.
    committed_configuration: Configuration,
    /// The log index of the latest committed CHANGE entry.
    configuration_index: u64,
    /// The log index of the latest CHANGE entry not yet committed, 0 when none.
    configuration_uncommitted_index: u64,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,

    /// The in-memory log.
    log: RaftLog<D>,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Never decreases. On the leader it advances through quorum replication; elsewhere
    /// it follows the leader's commit index carried on AppendEntries.
    commit_index: u64,
    /// The index of the highest log entry applied to the state machine.
    last_applied: u64,
    /// The index of the highest log entry handed to the state machine for application.
    last_applying: u64,
    /// The index of the highest log entry durably stored.
    last_stored: u64,

    /// The current term.
    ///
    /// Never decreases; is persisted together with `voted_for` before any vote response
    /// is sent.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    voted_for: Option<NodeId>,

    /// The identity of the last entry covered by the current snapshot.
    snapshot_last: LogId,
    /// A handle to the in-flight snapshot build, if one is running.
    snapshot_task: Option<AbortHandle>,

    /// An in-flight leadership transfer, if any.
    ///
    /// Lives on the core rather than the leader state: the transfer completes when this
    /// node, already stepped down to follower, observes the transferee as leader.
    transfer: Option<Transfer>,
    /// Set by a TimeoutNow request: the next election skips pre-vote and carries the
    /// disruption-protection override.
    disrupt_next_election: bool,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The deadline of the current election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            configuration: Configuration::new(),
            committed_configuration: Configuration::new(),
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            network,
            storage,
            target_state: State::Follower,
            log: RaftLog::new(LogId::default()),
            commit_index: 0,
            last_applied: 0,
            last_applying: 0,
            last_stored: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            snapshot_last: LogId::default(),
            snapshot_task: None,
            transfer: None,
            disrupt_next_election: false,
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.configuration = state.membership.clone();
        self.committed_configuration = state.membership;
        self.configuration_index = state.membership_index;
        self.last_applied = state.last_applied_log.index;
        self.last_applying = self.last_applied;
        self.last_stored = state.last_log_id.index;
        // Entries at or below last_applied are committed by definition; commit state
        // beyond that is rediscovered through the leader's commit index.
        self.commit_index = self.last_applied;

        if let Some(snapshot) = state.snapshot {
            self.snapshot_last = snapshot.last_log_id;
        }

        // Rebuild the in-memory log from storage, from right above the snapshot anchor.
        self.log = RaftLog::new(self.snapshot_last);
        if state.last_log_id.index > self.snapshot_last.index {
            let entries = self
                .storage
                .get_log_entries(self.snapshot_last.index + 1..state.last_log_id.index + 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            for entry in entries {
                self.log.append_entry(entry);
            }
        }

        let has_log = self.log.last_index() != 0;
        let single_voter =
            self.configuration.voter_count(Group::ANY) == 1 && self.is_voter(self.id);

        if has_log && single_voter {
            // The sole voter of a cluster with live state; become leader immediately.
            self.target_state = State::Leader;
        } else {
            self.target_state = State::Follower;
            if self.is_voter(self.id) {
                // A generous overhead on the initial election timeout, so that restarted
                // nodes don't disrupt a stable cluster by driving up their term before
                // network communication is established.
                let inst = Instant::now()
                    + Duration::from_secs(2)
                    + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
            }
        }

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is the central loop of the system. The Raft core assumes a few different
        // roles based on cluster state. The Raft core will delegate control to the
        // different state controllers and simply awaits the delegated loop to return,
        // which will only take place on a state change or on shutdown.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Unavailable => {
                    tracing::info!("id={} node is unavailable, terminating", self.id);
                    self.fail_transfer(TransferError::RaftError(RaftError::ShuttingDown));
                    self.report_metrics(Update::Update(None));
                    return Ok(());
                }
            }
        }
    }

    /// Whether the server with the given ID votes in any active group.
    fn is_voter(&self, id: NodeId) -> bool {
        match self.configuration.get(id) {
            Some(server) => self.configuration.is_voter(server, Group::ANY),
            None => false,
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
            membership_config: self.configuration.clone(),
            snapshot: self.snapshot_last,
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    ///
    /// The `(term, voted_for)` pair is persisted atomically; the single-owner task does
    /// not process any other inbound message while this write is in flight.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    ///
    /// Returns `None` for nodes which are not voters of the current configuration: they
    /// never campaign.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Option<Instant> {
        if !self.is_voter(self.id) {
            self.next_election_timeout = None;
            return None;
        }
        match self.next_election_timeout {
            Some(inst) => Some(inst),
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                Some(inst)
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Update the current term, resetting `voted_for` as required by a term bump.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Unavailable);
        RaftError::RaftStorage(err)
    }

    /// Observe that a safety-critical invariant does not hold and shut down.
    #[tracing::instrument(level = "trace", skip(self))]
    fn fatal_safety_violation(&mut self, msg: &str) -> RaftError {
        tracing::error!(id = self.id, "{}; shutting down", msg);
        self.set_target_state(State::Unavailable);
        RaftError::Shutdown
    }

    /// Adopt a configuration appended to the log but not yet committed.
    fn adopt_uncommitted_configuration(&mut self, conf: Configuration, index: u64) {
        self.configuration = conf;
        self.configuration_uncommitted_index = index;
        self.report_metrics(Update::Ignore);
    }

    /// Roll back an uncommitted configuration change truncated out of the log.
    fn rollback_uncommitted_configuration(&mut self) {
        tracing::debug!(
            id = self.id,
            index = self.configuration_uncommitted_index,
            "rolling back uncommitted configuration change"
        );
        self.configuration = self.committed_configuration.clone();
        self.configuration_uncommitted_index = 0;
    }

    /// Resolve the in-flight leadership transfer with an error.
    fn fail_transfer(&mut self, err: TransferError) {
        if let Some(transfer) = self.transfer.take() {
            if let Some(tx) = transfer.tx {
                let _ = tx.send(Err(err));
            }
        }
    }

    /// Check whether the in-flight leadership transfer has completed or expired.
    ///
    /// Called after message handling in every role loop: the transfer completes when this
    /// node observes the transferee as the current leader.
    fn check_transfer_progress(&mut self) {
        let transfer = match &self.transfer {
            Some(transfer) => transfer,
            None => return,
        };
        if self.target_state == State::Follower && self.current_leader == Some(transfer.id) {
            let transfer = self.transfer.take().unwrap();
            tracing::info!(id = self.id, transferee = transfer.id, "leadership transfer complete");
            if let Some(tx) = transfer.tx {
                let _ = tx.send(Ok(transfer.id));
            }
            return;
        }
        if Instant::now() >= transfer.deadline {
            tracing::warn!(id = self.id, transferee = transfer.id, "leadership transfer timed out");
            self.fail_transfer(TransferError::Timeout);
        }
    }

    /// Apply all committed entries to the state machine, in order.
    ///
    /// Entries are handed to the state machine in chunks bounded by `max_applied_batch`,
    /// with metrics reported between chunks; callbacks for the applied entries are
    /// dispatched by the caller in log order.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) async fn apply_committed(&mut self) -> RaftResult<Vec<Applied<R>>> {
        let mut out = Vec::new();
        while self.last_applying < self.commit_index {
            let mut batch = 0u64;
            while self.last_applying < self.commit_index && batch < self.config.max_applied_batch {
                let index = self.last_applying + 1;
                let entry = match self.log.get(index) {
                    Some(entry) => entry,
                    None => {
                        return Err(self.fatal_safety_violation("committed entry missing from the in-memory log"))
                    }
                };
                self.last_applying = index;
                batch += 1;

                match &entry.payload {
                    EntryPayload::Normal(_) => {
                        let res = self.storage.apply_to_state_machine(&[entry.as_ref()]).await;
                        match res {
                            Ok(mut results) => {
                                self.last_applied = index;
                                match results.pop() {
                                    Some(data) => out.push(Applied::Command { index, result: Ok(data) }),
                                    None => {
                                        return Err(self.map_fatal_storage_error(anyhow::anyhow!(
                                            "state machine returned no result for applied command"
                                        )))
                                    }
                                }
                            }
                            Err(err) => {
                                if err.downcast_ref::<S::ShutdownError>().is_some() {
                                    return Err(self.map_fatal_storage_error(err));
                                }
                                // An application-level apply failure: surfaced to the
                                // awaiting request, not fatal to the node.
                                self.last_applied = index;
                                out.push(Applied::Command { index, result: Err(err) });
                            }
                        }
                    }
                    EntryPayload::Barrier => {
                        self.last_applied = index;
                        out.push(Applied::Barrier { index });
                    }
                    EntryPayload::ConfigChange(change) => {
                        let res = self.storage.apply_to_state_machine(&[entry.as_ref()]).await;
                        if let Err(err) = res {
                            if err.downcast_ref::<S::ShutdownError>().is_some() {
                                return Err(self.map_fatal_storage_error(err));
                            }
                        }
                        self.commit_configuration(change.configuration.clone(), index);
                        self.last_applied = index;
                        out.push(Applied::Change {
                            index,
                            joint: change.configuration.phase == crate::membership::ConfigurationPhase::Joint,
                        });
                    }
                }
            }
            self.report_metrics(Update::Ignore);
        }
        self.trigger_log_compaction_if_needed(false);
        Ok(out)
    }

    /// Record the commitment of a configuration change.
    fn commit_configuration(&mut self, conf: Configuration, index: u64) {
        self.configuration = conf.clone();
        self.committed_configuration = conf;
        self.configuration_index = index;
        if self.configuration_uncommitted_index == index {
            self.configuration_uncommitted_index = 0;
        }
        if !self.configuration.contains(self.id) && self.target_state == State::Leader {
            // This node has been removed from the cluster; step down once the removal
            // commits.
            tracing::info!(id = self.id, "removed from the cluster, stepping down");
            self.set_target_state(State::Follower);
        }
    }

    /// Trigger a snapshot build if the log has outgrown the snapshot threshold.
    ///
    /// If `force` is true, the threshold check is skipped.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_task.is_some() {
            return;
        }
        // Snapshot-after-apply is only evaluated once applies have drained.
        if self.last_applying != self.last_applied || self.last_applied == 0 {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if !force && self.last_applied < self.snapshot_last.index + *threshold {
            return;
        }

        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_task = Some(handle);
        tokio::spawn(
            async move {
                let res = Abortable::new(storage.do_log_compaction(), reg).await;
                match res {
                    Ok(Ok(snapshot)) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.last_log_id));
                    }
                    Ok(Err(err)) => {
                        tracing::error!({error=%err}, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("log-compaction")),
        );
    }

    /// Handle the completion of an in-flight snapshot build.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        self.snapshot_task = None;
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            if log_id.index > self.snapshot_last.index && log_id.index <= self.log.last_index() {
                self.log.snapshot(log_id.index, self.config.snapshot_trailing);
                self.snapshot_last = log_id;
            }
            self.report_metrics(Update::Ignore);
        }
    }

    /// Reject an init config request due to the Raft node being in a state which
    /// prohibits the request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), crate::error::InitializeError>>) {
        let _ = tx.send(Err(crate::error::InitializeError::NotAllowed));
    }

    /// Reject a proposed config change request due to this node not being the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: ResponseTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader).into()));
    }

    /// Reject a transfer request due to this node not being the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_transfer_not_leader(&self, tx: TransferResponseTx) {
        let _ = tx.send(Err(TransferError::NodeNotLeader(self.current_leader)));
    }

    /// Forward the given client write request to the leader.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write_request(
        &self,
        req: crate::raft::ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        match req.entry {
            EntryPayload::Normal(entry) => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, self.current_leader)));
            }
            _ => {
                // This is unreachable, and well controlled by the type system, but let's
                // log an error for good measure.
                tracing::error!("unreachable branch hit: attempting to forward a Raft internal entry");
            }
        }
    }

    /// Forward the given barrier request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_barrier_request(&self, tx: BarrierResponseTx) {
        let _ = tx.send(Err(BarrierError::ForwardToLeader(self.current_leader)));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// An update on an in-flight snapshot build.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot build has finished successfully and covers the given index.
    SnapshotComplete(LogId),
    /// Snapshot build failed.
    SnapshotFailed,
}

/// An in-flight leadership transfer.
pub(self) struct Transfer {
    /// The transferee.
    pub id: NodeId,
    /// When the transfer expires with a timeout.
    pub deadline: Instant,
    /// Whether TimeoutNow has already been sent to the transferee.
    pub timeout_now_sent: bool,
    /// The response channel of the originating request.
    pub tx: Option<TransferResponseTx>,
}

/// The responder of a pending client request, fired when its entry applies.
#[derive(derive_more::From)]
pub(crate) enum Responder<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Barrier(BarrierResponseTx),
    Change(ResponseTx),
    /// An internal entry with nobody waiting on it.
    #[from(ignore)]
    None,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader, or passively awaiting one.
    ///
    /// Whether a follower campaigns on election timeout is governed by its role in the
    /// current configuration: only voters do.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node hit an unrecoverable error and is terminally unavailable.
    Unavailable,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Check if the node is terminally unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// The outcome of applying one committed entry, for callback dispatch.
pub(crate) enum Applied<R: AppDataResponse> {
    Command { index: u64, result: anyhow::Result<R> },
    Barrier { index: u64 },
    Change { index: u64, joint: bool },
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(crate) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// Per-peer replication progress, parallel to the configuration's server list.
    pub(super) progress: ProgressSet,
    /// Outstanding client requests, keyed by log index.
    pub(super) registry: RequestRegistry<D, R>,
    /// The metrics about a leader.
    pub(super) leader_metrics: LeaderMetrics,

    /// The ID of the server currently being caught up for promotion, 0 when none.
    pub(super) promotee_id: NodeId,
    /// The role the promotee will be assigned once caught up.
    pub(super) promotee_role: crate::membership::ServerRole,
    /// The server to be removed atomically with the promotion, 0 when none.
    pub(super) remove_id: NodeId,
    /// The catch-up round counter.
    pub(super) round_number: u64,
    /// The leader's last index when the current catch-up round started.
    pub(super) round_index: u64,
    /// When the current catch-up round started.
    pub(super) round_start: Instant,
    /// The responder of the change awaiting catch-up.
    pub(super) pending_promotion: Option<ResponseTx>,

    /// The index of the barrier appended on election win, 0 when none.
    pub(super) readable_barrier: u64,

    /// Deferred follow-up work, drained once per loop iteration.
    ///
    /// A committed joint configuration schedules its collapsing CHANGE here, and empty
    /// peers discovered during replication schedule their standby demotion, instead of
    /// being handled inline in the replication path that discovered them.
    pub(super) pending_joint_collapse: bool,
    pub(super) pending_demotions: Vec<NodeId>,

    /// When the recent-recv flags were last swept for check-quorum.
    pub(super) last_quorum_check: Instant,

    /// The stream of events coming from in-flight replication RPCs.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// The cloneable sender channel for replication events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        let progress = ProgressSet::build(
            &core.configuration,
            core.log.last_index(),
            core.last_stored,
            core.id,
            Instant::now(),
        );
        Self {
            core,
            progress,
            registry: RequestRegistry::new(),
            leader_metrics: LeaderMetrics::default(),
            promotee_id: 0,
            promotee_role: crate::membership::ServerRole::Spare,
            remove_id: 0,
            round_number: 0,
            round_index: 0,
            round_start: Instant::now(),
            pending_promotion: None,
            readable_barrier: 0,
            pending_joint_collapse: false,
            pending_demotions: Vec::new(),
            last_quorum_check: Instant::now(),
            replication_rx,
            replication_tx,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        let mut heartbeat = interval(Duration::from_millis(self.core.config.heartbeat_interval));

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                self.step_down_cleanup();
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                _ = heartbeat.tick() => {
                    self.replication_heartbeat().await;
                    self.evaluate_check_quorum();
                    self.evaluate_catch_up_round_deadline();
                    self.core.check_transfer_progress();
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        RaftMsg::Barrier{tx} => {
                            self.handle_barrier_request(tx).await;
                        }
                        RaftMsg::Initialize{tx, ..} => {
                            self.core.reject_init_with_config(tx);
                        }
                        RaftMsg::AddServer{id, tx} => {
                            self.handle_add_server(id, tx).await;
                        }
                        RaftMsg::AssignRole{id, role, tx} => {
                            self.handle_assign_role(id, role, tx).await;
                        }
                        RaftMsg::JointPromote{id, role, remove_id, tx} => {
                            self.handle_joint_promote(id, role, remove_id, tx).await;
                        }
                        RaftMsg::RemoveServer{id, tx} => {
                            self.handle_remove_server(id, tx).await;
                        }
                        RaftMsg::DuplicateConfiguration{tx} => {
                            self.handle_duplicate_configuration(tx).await;
                        }
                        RaftMsg::TransferLeadership{target, tx} => {
                            self.handle_transfer_leadership(target, tx).await;
                        }
                    }
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    self.handle_replica_event(event).await?;
                }
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Unavailable);
                }
            }

            if self.core.target_state.is_leader() {
                self.process_deferred_changes().await?;
            }
        }
    }

    /// Fail everything still pending when leadership is lost.
    fn step_down_cleanup(&mut self) {
        for pending in self.registry.drain_all() {
            match pending.responder {
                Responder::Client(tx) => {
                    // Hand the original payload back so the client can retry elsewhere.
                    let data = self.core.log.get(pending.index).and_then(|entry| match &entry.payload {
                        EntryPayload::Normal(normal) => Some(normal.data.clone()),
                        _ => None,
                    });
                    match data {
                        Some(data) => {
                            let _ = tx.send(Err(ClientWriteError::ForwardToLeader(data, self.core.current_leader)));
                        }
                        None => {
                            let _ = tx.send(Err(ClientWriteError::RaftError(RaftError::ShuttingDown)));
                        }
                    }
                }
                Responder::Barrier(tx) => {
                    let _ = tx.send(Err(BarrierError::ForwardToLeader(self.core.current_leader)));
                }
                Responder::Change(tx) => {
                    let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.core.current_leader).into()));
                }
                Responder::None => {}
            }
        }
        if let Some(tx) = self.pending_promotion.take() {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.core.current_leader).into()));
        }
        // A transfer, if in flight, stays on the core: it completes once this node
        // observes the transferee as leader.
    }

    /// Dispatch callbacks for freshly applied entries, in log order.
    pub(super) fn dispatch_applied(&mut self, applied: Vec<Applied<R>>) {
        for item in applied {
            match item {
                Applied::Command { index, result } => {
                    let responder = self.registry.remove_at(index).map(|p| p.responder);
                    if let Some(Responder::Client(tx)) = responder {
                        let res = match result {
                            Ok(data) => Ok(ClientWriteResponse { index, data }),
                            Err(err) => Err(ClientWriteError::RaftError(RaftError::RaftStorage(err))),
                        };
                        let _ = tx.send(res);
                    }
                }
                Applied::Barrier { index } => {
                    if self.readable_barrier == index {
                        // The term barrier committed: reads are linearizable from here on.
                        self.leader_metrics.readable = true;
                        self.readable_barrier = 0;
                    }
                    let responder = self.registry.remove_at(index).map(|p| p.responder);
                    if let Some(Responder::Barrier(tx)) = responder {
                        let _ = tx.send(Ok(index));
                    }
                }
                Applied::Change { index, joint } => {
                    if self.readable_barrier == index {
                        // The initial configuration entry anchors the term like a barrier.
                        self.leader_metrics.readable = true;
                        self.readable_barrier = 0;
                    }
                    let responder = self.registry.remove_at(index).map(|p| p.responder);
                    if let Some(Responder::Change(tx)) = responder {
                        let _ = tx.send(Ok(index));
                    }
                    if joint {
                        // The joint configuration committed in both groups; schedule the
                        // follow-up CHANGE collapsing to the NEW group.
                        self.pending_joint_collapse = true;
                    }
                }
            }
        }
        self.leader_report_metrics();
    }

    /// Drain deferred configuration work scheduled by the replication and apply paths.
    async fn process_deferred_changes(&mut self) -> RaftResult<()> {
        if self.pending_joint_collapse {
            self.pending_joint_collapse = false;
            self.submit_joint_collapse().await?;
        }
        while let Some(target) = self.pending_demotions.pop() {
            self.demote_empty_peer_to_standby(target).await;
            if !self.core.target_state.is_leader() {
                break;
            }
        }
        Ok(())
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        let metrics = self.leader_metrics.clone();
        self.core.report_metrics(Update::Update(Some(&metrics)));
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(crate) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The IDs of the peers which granted their vote this round, including this node.
    granted: BTreeSet<NodeId>,
    /// Whether the current round is a pre-vote probe.
    in_pre_vote: bool,
    /// Whether this election carries the disruption-protection override.
    disrupt_leader: bool,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let disrupt_leader = core.disrupt_next_election;
        core.disrupt_next_election = false;
        Self {
            core,
            granted: BTreeSet::new(),
            in_pre_vote: false,
            disrupt_leader,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // A transferee starts a real election right away; everyone else probes with a
        // pre-vote round first when enabled.
        let mut run_real_election = !self.core.config.pre_vote || self.disrupt_leader;

        // Each iteration of the outer loop represents a new election round.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.granted.clear();
            self.granted.insert(self.core.id);
            self.in_pre_vote = !run_real_election;
            // A timed-out real election falls back to probing again next round.
            run_real_election = false;

            self.core.update_next_election_timeout(false);

            let mut pending_votes = if self.in_pre_vote {
                // Probe with current_term + 1 without persisting anything.
                self.spawn_parallel_vote_requests(self.core.current_term + 1, true)
            } else {
                self.core.current_term += 1;
                self.core.voted_for = Some(self.core.id);
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.save_hard_state().await?;
                self.core.report_metrics(Update::Update(None));
                self.spawn_parallel_vote_requests(self.core.current_term, false)
            };

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_inst = match self.core.get_next_election_timeout() {
                    Some(inst) => inst,
                    None => {
                        // No longer a voter of the current configuration.
                        self.core.set_target_state(State::Follower);
                        return Ok(());
                    }
                };
                let timeout_fut = sleep_until(timeout_inst);

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    // This election round has timed out; break to the outer loop, which
                    // starts a new round.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        let pre_vote_won = self.handle_vote_response(res, peer).await?;
                        if pre_vote_won {
                            run_real_election = true;
                            break;
                        }
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot{rpc, tx} => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::TimeoutNow{rpc, tx} => {
                                let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                            RaftMsg::Barrier{tx} => {
                                self.core.forward_barrier_request(tx);
                            }
                            RaftMsg::Initialize{tx, ..} => {
                                self.core.reject_init_with_config(tx);
                            }
                            RaftMsg::AddServer{tx, ..} | RaftMsg::AssignRole{tx, ..}
                                | RaftMsg::JointPromote{tx, ..} | RaftMsg::RemoveServer{tx, ..}
                                | RaftMsg::DuplicateConfiguration{tx} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::TransferLeadership{tx, ..} => {
                                self.core.reject_transfer_not_leader(tx);
                            }
                        }
                        self.core.check_transfer_progress();
                    }
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Unavailable),
                }
            }

            // Only the first election after TimeoutNow may disrupt a live leader.
            self.disrupt_leader = false;
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(crate) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    ///
    /// Followers which are not voters of the current configuration are passive: they
    /// replicate entries but never campaign.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            // Value is updated as heartbeats are received. Non-voters wait far in the
            // future: they only react to messages.
            let election_timeout = match self.core.get_next_election_timeout() {
                Some(inst) => sleep_until(inst),
                None => sleep_until(Instant::now() + Duration::from_secs(3600)),
            };

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => {
                    if self.core.is_voter(self.core.id) {
                        self.core.set_target_state(State::Candidate);
                    }
                    self.core.check_transfer_progress();
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::TimeoutNow{rpc, tx} => {
                            let _ = tx.send(self.core.handle_timeout_now_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::Barrier{tx} => {
                            self.core.forward_barrier_request(tx);
                        }
                        RaftMsg::Initialize{members, tx} => {
                            let _ = tx.send(self.handle_init_with_config(members).await);
                        }
                        RaftMsg::AddServer{tx, ..} | RaftMsg::AssignRole{tx, ..}
                            | RaftMsg::JointPromote{tx, ..} | RaftMsg::RemoveServer{tx, ..}
                            | RaftMsg::DuplicateConfiguration{tx} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::TransferLeadership{tx, ..} => {
                            self.core.reject_transfer_not_leader(tx);
                        }
                    }
                    self.core.check_transfer_progress();
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Unavailable),
            }
        }
    }

    /// Handle the admin `initialize` command.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        mut members: BTreeSet<NodeId>,
    ) -> Result<(), crate::error::InitializeError> {
        if self.core.log.last_index() != 0 || self.core.current_term != 0 {
            tracing::error!(
                {last_log_index=self.core.log.last_index(), self.core.current_term},
                "rejecting initialize request, log index or term is not 0",
            );
            return Err(crate::error::InitializeError::NotAllowed);
        }

        // Ensure given config contains this node's ID as well.
        members.insert(self.core.id);

        // Build a new membership config from given init data & assign it as the new
        // cluster membership config in memory only; it is replicated through the new
        // leader's initial CHANGE entry.
        self.core.configuration = Configuration::with_voters(members);
        self.core.committed_configuration = self.core.configuration.clone();

        // Become a candidate and start campaigning for leadership. If this node is the
        // only node in the cluster, then become leader without holding an election.
        if self.core.configuration.voter_count(Group::ANY) == 1 {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else {
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}
