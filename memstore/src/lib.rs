//! An in-memory `RaftStorage` implementation.
//!
//! Used by the flexraft test harness and as a reference for storage implementors. All
//! state lives in memory; "durability" is a write into a locked map.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use flexraft::async_trait::async_trait;
use flexraft::membership::Configuration;
use flexraft::raft::Entry;
use flexraft::raft::EntryPayload;
use flexraft::storage::HardState;
use flexraft::storage::InitialState;
use flexraft::storage::Snapshot;
use flexraft::storage::SnapshotMeta;
use flexraft::AppData;
use flexraft::AppDataResponse;
use flexraft::LogId;
use flexraft::NodeId;
use flexraft::RaftStorage;
use flexraft::RaftStorageDebug;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should
    /// probably be an enum representing all of the various types of requests / operations
    /// which a client can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// The error used to trigger Raft shutdown from the storage layer.
#[derive(Debug, thiserror::Error)]
#[error("unsafe storage error")]
pub struct ShutdownError;

/// The state machine of the `MemStore`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,

    /// The latest cluster configuration applied to the state machine, with the log index
    /// it was appended at.
    pub last_membership: Option<(Configuration, u64)>,

    /// A mapping of client IDs to their state info, for at-most-once semantics.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `flexraft::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this storage instance is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<Snapshot>>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(MemStoreStateMachine::default()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
        }
    }

    /// Create a new `MemStore` instance with some existing state, for crash/restart
    /// scenarios.
    pub fn new_with_state(
        id: NodeId,
        log: BTreeMap<u64, Entry<ClientRequest>>,
        sm: MemStoreStateMachine,
        hs: Option<HardState>,
        current_snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            id,
            log: RwLock::new(log),
            sm: RwLock::new(sm),
            hs: RwLock::new(hs),
            current_snapshot: RwLock::new(current_snapshot),
        }
    }

    /// The ID of the Raft node this store belongs to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get a full copy of the current log, for assertions in tests.
    pub async fn get_log(&self) -> BTreeMap<u64, Entry<ClientRequest>> {
        self.log.read().await.clone()
    }

    async fn membership_from_log(&self) -> (Configuration, u64) {
        let log = self.log.read().await;
        for (index, entry) in log.iter().rev() {
            if let EntryPayload::ConfigChange(change) = &entry.payload {
                return (change.configuration.clone(), *index);
            }
        }
        drop(log);
        let snapshot = self.current_snapshot.read().await;
        match &*snapshot {
            Some(snapshot) => (snapshot.meta.membership.clone(), snapshot.meta.membership_index),
            None => (Configuration::new(), 0),
        }
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> Result<(Configuration, u64)> {
        Ok(self.membership_from_log().await)
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let hs = self.hs.read().await.clone().unwrap_or_default();
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        let snapshot = self.current_snapshot.read().await;

        let snapshot_meta = snapshot.as_ref().map(|snap| snap.meta.clone());
        let last_log_id = match log.values().rev().next() {
            Some(entry) => entry.log_id,
            None => snapshot_meta.as_ref().map(|meta| meta.last_log_id).unwrap_or_default(),
        };
        let last_applied_log = sm.last_applied_log;
        drop(log);
        drop(sm);
        drop(snapshot);

        let (membership, membership_index) = self.membership_from_log().await;
        Ok(InitialState {
            last_log_id,
            last_applied_log,
            hard_state: hs,
            membership,
            membership_index,
            snapshot: snapshot_meta,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn delete_logs_from(&self, from: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&from);
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(normal) => {
                    let data = &normal.data;
                    // At-most-once: a replayed serial returns the recorded response.
                    if let Some((serial, res)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            responses.push(ClientResponse(res.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    responses.push(ClientResponse(previous));
                }
                EntryPayload::Barrier => {
                    responses.push(ClientResponse(None));
                }
                EntryPayload::ConfigChange(change) => {
                    sm.last_membership = Some((change.configuration.clone(), entry.log_id.index));
                    responses.push(ClientResponse(None));
                }
            }
        }
        Ok(responses)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot> {
        let sm = self.sm.read().await;
        let data = serde_json::to_vec(&*sm)?;
        let last_log_id = sm.last_applied_log;
        let (membership, membership_index) = match &sm.last_membership {
            Some((conf, index)) => (conf.clone(), *index),
            None => (Configuration::new(), 0),
        };
        drop(sm);

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_log_id,
                membership,
                membership_index,
            },
            data,
        };
        *self.current_snapshot.write().await = Some(snapshot.clone());
        tracing::debug!(id = self.id, snapshot_index = last_log_id.index, "log compaction complete");
        Ok(snapshot)
    }

    async fn install_snapshot(&self, meta: &SnapshotMeta, snapshot: Vec<u8>) -> Result<()> {
        let new_sm: MemStoreStateMachine = serde_json::from_slice(&snapshot)?;
        {
            let mut log = self.log.write().await;
            *log = log.split_off(&(meta.last_log_id.index + 1));
        }
        *self.sm.write().await = new_sm;
        *self.current_snapshot.write().await = Some(Snapshot {
            meta: meta.clone(),
            data: snapshot,
        });
        tracing::debug!(id = self.id, snapshot_index = meta.last_log_id.index, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.current_snapshot.read().await.clone())
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use flexraft::membership::ServerRole;
    use flexraft::raft::EntryConfigChange;
    use flexraft::raft::EntryNormal;

    use super::*;

    fn entry(term: u64, index: u64, client: &str, serial: u64, status: &str) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(EntryNormal {
                data: ClientRequest {
                    client: client.into(),
                    serial,
                    status: status.into(),
                },
            }),
        }
    }

    #[tokio::test]
    async fn test_initial_state_pristine() {
        let store = MemStore::new(1);
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.last_log_id, LogId::default());
        assert_eq!(state.hard_state, HardState::default());
        assert!(state.membership.servers.is_empty());
        assert!(state.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_apply_tracks_client_serials() {
        let store = MemStore::new(1);
        let first = entry(1, 1, "c0", 0, "a");
        let second = entry(1, 2, "c0", 1, "b");
        let replayed = entry(1, 3, "c0", 1, "b");

        let res = store.apply_to_state_machine(&[&first, &second]).await.unwrap();
        assert_eq!(res, vec![ClientResponse(None), ClientResponse(Some("a".into()))]);

        // Replaying the same serial returns the recorded response without mutating.
        let res = store.apply_to_state_machine(&[&replayed]).await.unwrap();
        assert_eq!(res, vec![ClientResponse(Some("a".into()))]);
        let sm = store.get_state_machine().await;
        assert_eq!(sm.client_status.get("c0"), Some(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_membership_found_in_log() {
        let store = MemStore::new(1);
        let conf = Configuration::with_voters(vec![1, 2, 3]);
        let change = Entry {
            log_id: LogId { term: 1, index: 4 },
            payload: EntryPayload::ConfigChange(EntryConfigChange {
                configuration: conf.clone(),
            }),
        };
        store.append_to_log(&[&change]).await.unwrap();

        let (found, index) = store.get_membership_config().await.unwrap();
        assert_eq!(found, conf);
        assert_eq!(index, 4);
        assert_eq!(found.server_role(1), Some(ServerRole::Voter));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = MemStore::new(1);
        let e = entry(1, 1, "c0", 0, "a");
        store.apply_to_state_machine(&[&e]).await.unwrap();
        let snapshot = store.do_log_compaction().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, LogId { term: 1, index: 1 });

        let restored = MemStore::new(2);
        restored.install_snapshot(&snapshot.meta, snapshot.data.clone()).await.unwrap();
        let sm = restored.get_state_machine().await;
        assert_eq!(sm.last_applied_log, LogId { term: 1, index: 1 });
        assert_eq!(sm.client_status.get("c0"), Some(&"a".to_string()));
    }
}
