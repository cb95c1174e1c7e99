//! The leader side of client requests: append, replicate, commit, apply, respond.

use crate::core::LeaderState;
use crate::core::Responder;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::membership::ConfigurationPhase;
use crate::membership::Group;
use crate::raft::BarrierResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::registry::RequestKind;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit an initial entry as part of becoming the cluster leader (§8).
    ///
    /// For a cluster with no log yet, the initial entry replicates the configuration
    /// itself; a leader taking over mid joint-transition completes it; otherwise a
    /// barrier entry anchors the new term. Reads are linearizable only once the initial
    /// entry has committed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let last_index = self.core.log.last_index();

        if last_index == 0 {
            // The cluster has just formed: replicate the configuration so every member
            // learns it through the log.
            let conf = self.core.configuration.clone();
            let index = self.append_configuration(conf, Responder::None).await?;
            self.readable_barrier = index;
            return Ok(());
        }

        // A membership change appends two consecutive CHANGE entries: the joint config
        // and the collapsed one. If this leader took over right after the joint entry,
        // it must complete the transition.
        if let Some(entry) = self.core.log.get(last_index) {
            if let EntryPayload::ConfigChange(change) = &entry.payload {
                if change.configuration.phase == ConfigurationPhase::Joint {
                    let collapsed = change.configuration.joint_to_normal(Group::NEW);
                    let index = self.append_configuration(collapsed, Responder::None).await?;
                    self.readable_barrier = index;
                    return Ok(());
                }
            }
        }

        if self.core.config.no_op {
            // The barrier append itself triggers the first replication round; reads
            // become linearizable once it commits.
            let index = self.append_payload(EntryPayload::Barrier).await?;
            self.registry.enqueue(index, RequestKind::Barrier, Responder::None);
            self.readable_barrier = index;
            self.commit_and_replicate().await?;
        } else {
            self.leader_metrics.readable = true;
            self.replication_heartbeat().await;
        }
        Ok(())
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        // A transferring or removed leader accepts no new requests.
        if self.core.transfer.is_some() || !self.core.configuration.contains(self.core.id) {
            self.core.forward_client_write_request(rpc, tx);
            return;
        }

        let index = match self.append_payload(rpc.entry).await {
            Ok(index) => index,
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.registry.enqueue(index, RequestKind::Command, Responder::Client(tx));
        if let Err(err) = self.commit_and_replicate().await {
            tracing::error!({error=%err, id=self.core.id}, "error while replicating client request");
        }
    }

    /// Handle a barrier request: an empty entry which, once applied, guarantees that
    /// everything committed before it has been applied.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_barrier_request(&mut self, tx: BarrierResponseTx) {
        if self.core.transfer.is_some() || !self.core.configuration.contains(self.core.id) {
            self.core.forward_barrier_request(tx);
            return;
        }

        let index = match self.append_payload(EntryPayload::Barrier).await {
            Ok(index) => index,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        self.registry.enqueue(index, RequestKind::Barrier, Responder::Barrier(tx));
        if let Err(err) = self.commit_and_replicate().await {
            tracing::error!({error=%err, id=self.core.id}, "error while replicating barrier");
        }
    }

    /// Append a payload to the in-memory log and store it durably, returning its index.
    ///
    /// The leader's own progress advances with its stored log, which counts towards
    /// quorum like any follower acknowledgement.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload(&mut self, payload: EntryPayload<D>) -> RaftResult<u64> {
        let index = self.core.log.append(self.core.current_term, payload);

        let view = self.core.log.acquire(index, index);
        let refs: Vec<&Entry<D>> = view.iter().map(|entry| entry.as_ref()).collect();
        let res = self.core.storage.append_to_log(&refs).await;
        drop(view);
        if let Err(err) = res {
            self.core.log.discard(index);
            return Err(self.core.map_fatal_storage_error(err));
        }

        self.core.last_stored = index;
        if let Some(i) = self.core.configuration.index_of(self.core.id) {
            self.progress.get_mut(i).maybe_update(index);
        }
        self.leader_report_metrics();
        Ok(index)
    }

    /// Advance the commit index if quorum allows, apply, and trigger replication.
    pub(super) async fn commit_and_replicate(&mut self) -> RaftResult<()> {
        self.quorum_commit_and_apply().await?;
        if !self.core.target_state.is_leader() {
            return Ok(());
        }
        self.replication_trigger().await;
        Ok(())
    }
}
