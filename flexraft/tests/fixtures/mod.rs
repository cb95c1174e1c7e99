//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use flexraft::async_trait::async_trait;
use flexraft::error::ClientWriteError;
use flexraft::error::ResponseError;
use flexraft::error::TransferError;
use flexraft::membership::ServerRole;
use flexraft::metrics::Wait;
use flexraft::raft::AppendEntriesRequest;
use flexraft::raft::AppendEntriesResponse;
use flexraft::raft::ClientWriteRequest;
use flexraft::raft::InstallSnapshotRequest;
use flexraft::raft::TimeoutNowRequest;
use flexraft::raft::VoteRequest;
use flexraft::raft::VoteResponse;
use flexraft::Config;
use flexraft::LogId;
use flexraft::NodeId;
use flexraft::Raft;
use flexraft::RaftMetrics;
use flexraft::RaftNetwork;
use flexraft::RaftStorageDebug;
use flexraft::State;
use memstore::ClientRequest as MemClientRequest;
use memstore::ClientResponse as MemClientResponse;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<MemClientRequest, MemClientResponse, RaftRouter, MemStore>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// To emulate network delay for sending, in milliseconds. 0 means no delay.
    send_delay: u64,
}

pub struct Builder {
    config: Arc<Config>,
    send_delay: u64,
}

impl Builder {
    pub fn send_delay(mut self, ms: u64) -> Self {
        self.send_delay = ms;
        self
    }

    pub fn build(self) -> RaftRouter {
        RaftRouter {
            config: self.config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            send_delay: self.send_delay,
        }
    }
}

impl RaftRouter {
    pub fn builder(config: Arc<Config>) -> Builder {
        Builder { config, send_delay: 0 }
    }

    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self::builder(config).build()
    }

    async fn rand_send_delay(&self) {
        if self.send_delay == 0 {
            return;
        }
        let r = rand::random::<u64>() % self.send_delay;
        tokio::time::sleep(Duration::from_millis(r)).await;
    }

    /// Create a cluster of voters, with node 0 as the initial leader.
    ///
    /// Node 0 is initialized as a single-node cluster first; the other voters are then
    /// added as spares and promoted. Returns the log index the cluster has converged on.
    pub async fn new_cluster(self: &Arc<Self>, node_ids: BTreeSet<NodeId>) -> Result<u64> {
        assert!(node_ids.contains(&0));

        self.new_raft_node(0).await;

        tracing::info!("--- initializing single node cluster: 0");
        self.initialize(0).await?;
        let mut want = 1;

        self.wait_for_log(&maplit::btreeset![0], want, timeout(), "init").await?;
        self.wait_for_state(&maplit::btreeset![0], State::Leader, timeout(), "init").await?;

        for id in node_ids.iter() {
            if *id == 0 {
                continue;
            }
            tracing::info!("--- adding voter: {}", id);
            self.new_raft_node(*id).await;
            self.add_server(0, *id).await?;
            want += 1;
            self.assign_role(0, *id, ServerRole::Voter).await?;
            want += 1;
            self.wait_for_log(&maplit::btreeset![0], want, timeout(), "promote").await?;
        }

        self.wait_for_log(&node_ids, want, timeout(), "cluster formed").await?;
        Ok(want)
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let memstore = Arc::new(MemStore::new(id));
        self.new_raft_node_with_sto(id, memstore).await
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, sto: Arc<MemStore>) {
        let node = Raft::new(id, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation, returning its handles.
    pub async fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<MemStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
        opt_handles
    }

    /// Initialize the cluster from the given node, with all registered nodes as voters.
    pub async fn initialize(&self, node: NodeId) -> Result<()> {
        let rt = self.routing_table.read().await;
        let members: BTreeSet<NodeId> = maplit::btreeset![node];
        rt.get(&node)
            .ok_or_else(|| anyhow!("node {} not found in routing table", node))?
            .0
            .initialize(members)
            .await?;
        Ok(())
    }

    /// Initialize cluster with the specified voter IDs.
    pub async fn initialize_with(&self, node: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        let rt = self.routing_table.read().await;
        rt.get(&node)
            .ok_or_else(|| anyhow!("node {} not found in routing table", node))?
            .0
            .initialize(members)
            .await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.0.metrics().borrow().clone()).collect()
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.1.clone())
    }

    /// Get a handle to the Raft node with the given ID.
    pub async fn get_raft_handle(&self, node_id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.0.clone())
    }

    /// Wait for metrics until it satisfies some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    /// Wait for specified nodes until they have applied up to `want_log` (inclusive).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `want_state`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their snapshot anchor becomes `want`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_snapshot(
        &self,
        node_ids: &BTreeSet<u64>,
        want: LogId,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.snapshot(want, msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    pub async fn add_server(&self, leader: NodeId, target: NodeId) -> Result<u64, ResponseError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.add_server(target).await
    }

    pub async fn assign_role(&self, leader: NodeId, target: NodeId, role: ServerRole) -> Result<u64, ResponseError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.assign_role(target, role).await
    }

    pub async fn joint_promote(
        &self,
        leader: NodeId,
        target: NodeId,
        role: ServerRole,
        remove: NodeId,
    ) -> Result<u64, ResponseError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.joint_promote(target, role, remove).await
    }

    pub async fn remove_server(&self, leader: NodeId, target: NodeId) -> Result<u64, ResponseError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.remove_server(target).await
    }

    pub async fn transfer_leadership(&self, leader: NodeId, target: NodeId) -> Result<NodeId, TransferError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.transfer_leadership(target).await
    }

    /// Send a barrier to the target node, returning its log index.
    pub async fn barrier(&self, target: NodeId) -> Result<u64> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node with ID {} does not exist", target));
        Ok(node.0.barrier().await?)
    }

    /// Send a client request to the target node, causing test failure on error.
    pub async fn client_request(&self, target: NodeId, client_id: &str, serial: u64) {
        let req = MemClientRequest {
            client: client_id.into(),
            serial,
            status: format!("request-{}", serial),
        };
        if let Err(err) = self.send_client_request(target, req).await {
            tracing::error!({error=%err}, "error from client request");
            panic!("{:?}", err)
        }
    }

    /// Request the current leader from the target node.
    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node with ID {} does not exist", target));
        node.0.current_leader().await
    }

    /// Send multiple client requests to the target node, causing test failure on error.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, client_id, idx as u64).await
        }
    }

    async fn send_client_request(
        &self,
        target: NodeId,
        req: MemClientRequest,
    ) -> std::result::Result<MemClientResponse, ClientWriteError<MemClientRequest>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node '{}' does not exist in routing table", target));
        node.0.client_write(ClientWriteRequest::new(req)).await.map(|res| res.data)
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster has an elected leader, and is in a stable state where all
    /// non-isolated nodes agree on leader, term and log position.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = non_isolated
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = non_isolated.iter().filter(|node| node.state == State::Follower).collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated.len() - 1,
        );
        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);

        for node in non_isolated.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
        }
    }

    /// Assert that the state machines of the given nodes hold the same client data.
    pub async fn assert_same_state_machines(&self, node_ids: &BTreeSet<NodeId>) {
        let mut prev: Option<(NodeId, memstore::MemStoreStateMachine)> = None;
        for id in node_ids {
            let sto = self.get_storage_handle(id).await.unwrap();
            let sm = sto.get_state_machine().await;
            if let Some((prev_id, prev_sm)) = &prev {
                assert_eq!(
                    prev_sm.client_status, sm.client_status,
                    "state machines of node {} and {} diverge",
                    prev_id, id
                );
                assert_eq!(prev_sm.last_applied_log, sm.last_applied_log);
            }
            prev = Some((*id, sm));
        }
    }
}

/// The default timeout for fixture waits.
pub fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(5000))
}

#[async_trait]
impl RaftNetwork<MemClientRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self,
        target: u64,
        rpc: AppendEntriesRequest<MemClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let resp = addr.0.append_entries(rpc).await;
        Ok(resp?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self,
        target: u64,
        rpc: InstallSnapshotRequest,
    ) -> Result<AppendEntriesResponse> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.install_snapshot(rpc).await?)
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.vote(rpc).await?)
    }

    /// Send a TimeoutNow RPC to the target Raft node, as part of leadership transfer.
    async fn send_timeout_now(&self, target: u64, rpc: TimeoutNowRequest) -> Result<()> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.timeout_now(rpc).await?)
    }
}
