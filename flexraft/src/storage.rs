//! The Raft storage interface and data types.

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::Configuration;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// The metadata of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotMeta {
    /// Log entries up to which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: Configuration,
    /// The log index at which `membership` was appended.
    pub membership_index: u64,
}

/// A snapshot of the state machine, with the metadata describing its coverage.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Snapshot {
    /// Metadata of the snapshot.
    pub meta: SnapshotMeta,
    /// The serialized state machine at `meta.last_log_id`.
    pub data: Vec<u8>,
}

/// A record holding the hard state of a Raft node.
///
/// The current term and the vote cast in it must be persisted atomically: a node must
/// never respond to a vote request before the pair is durable.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry in the log.
    pub last_log_id: LogId,
    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log or snapshot, else an
    /// empty configuration.
    pub membership: Configuration,
    /// The log index at which `membership` was appended, 0 for the empty configuration.
    pub membership_index: u64,
    /// The metadata of the current snapshot, if one exists.
    pub snapshot: Option<SnapshotMeta>,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Configuration::new(),
            membership_index: 0,
            snapshot: None,
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// This is one half of the node's I/O seam (the other being `RaftNetwork`). All methods
/// are driven from the node's single state-machine task, so calls for a given node are
/// naturally serialized: a durable write completes before the next inbound message is
/// processed.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The error type used to indicate to Raft that shutdown is needed when calling the
    /// `apply_to_state_machine` method.
    ///
    /// This error type is only considered for the `apply_to_state_machine` method as it is
    /// the only method which is allowed to return errors normally as part of application logic.
    ///
    /// For all other methods of this trait, returning an error will cause Raft to shutdown.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership config found in the log or snapshot, along with the log
    /// index at which it was appended.
    ///
    /// This must always be implemented as a reverse search through the log for the most
    /// recent configuration entry, falling back to the configuration recorded in the
    /// current snapshot, and to an empty configuration for a pristine store.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership_config(&self) -> Result<(Configuration, u64)>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage
    /// system to fetch the last known state from stable storage. If no such state exists
    /// due to being the first time the node has come online, then
    /// `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state, atomically.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive:
    /// `[start, stop)`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry. Returns `None` when the entry is not present.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Delete all logs from `from` on, durably.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from(&self, from: u64) -> Result<()>;

    /// Append a payload of entries to the log, durably.
    ///
    /// Though the entries will always be presented in order, each entry's index should be
    /// used to determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of entries to the state machine, in order.
    ///
    /// The Raft protocol guarantees that only logs which have been _committed_, that is,
    /// logs which have been replicated to a quorum of the cluster, will be applied to the
    /// state machine. This is where the business logic of interacting with your
    /// application's state machine should live.
    ///
    /// If an error returned from this method is an instance of `Self::ShutdownError`,
    /// Raft goes into shutdown to preserve data safety. Any other error is treated as an
    /// application-level apply failure and is propagated to the awaiting client request.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Perform log compaction, returning the generated snapshot.
    ///
    /// The snapshot must cover the state machine exactly up to its recorded
    /// `meta.last_log_id`, along with the membership configuration committed at or below
    /// that point.
    ///
    /// Errors returned from this method will be logged and compaction retried later.
    async fn do_log_compaction(&self) -> Result<Snapshot>;

    /// Install a snapshot received from the cluster leader.
    ///
    /// Implementations must restore the state machine from `snapshot`, delete all log
    /// entries up to and including `meta.last_log_id.index`, and replace any previous
    /// snapshot, atomically with respect to crashes.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn install_snapshot(&self, meta: &SnapshotMeta, snapshot: Vec<u8>) -> Result<()>;

    /// Get the current snapshot, if any.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
