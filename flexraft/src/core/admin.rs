//! Cluster membership changes and leadership transfer, leader side.

use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::LeaderState;
use crate::core::Responder;
use crate::core::Transfer;
use crate::error::ChangeConfigError;
use crate::error::RaftResult;
use crate::error::TransferError;
use crate::membership::AddError;
use crate::membership::Configuration;
use crate::membership::ConfigurationPhase;
use crate::membership::Group;
use crate::membership::ServerRole;
use crate::progress::ProgressState;
use crate::raft::ResponseTx;
use crate::raft::TransferResponseTx;
use crate::registry::RequestKind;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Check whether a configuration change may be proposed right now.
    ///
    /// Changes are serialized: a leadership transfer, an uncommitted CHANGE entry or a
    /// running catch-up all park further changes. The JOINT phase admits only changes
    /// which collapse it.
    fn can_change_configuration(&self, allow_joint: bool) -> Result<(), ChangeConfigError> {
        if self.core.transfer.is_some() {
            return Err(ChangeConfigError::NodeNotLeader(None));
        }
        if self.core.configuration_uncommitted_index != 0 || self.promotee_id != 0 {
            return Err(ChangeConfigError::ChangeInProgress);
        }
        if !allow_joint && self.core.configuration.phase == ConfigurationPhase::Joint {
            return Err(ChangeConfigError::ChangeInProgress);
        }
        Ok(())
    }

    /// Handle the admin command adding a new server to the cluster as a spare.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_add_server(&mut self, id: NodeId, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration(false) {
            let _ = tx.send(Err(err.into()));
            return;
        }

        let mut conf = self.core.configuration.clone();
        if let Err(err) = conf.add(id, ServerRole::Spare) {
            let err = match err {
                AddError::BadId => ChangeConfigError::BadId(id),
                AddError::DuplicateId => ChangeConfigError::DuplicateId(id),
            };
            let _ = tx.send(Err(err.into()));
            return;
        }

        tracing::info!(id = self.core.id, target = id, "adding server as spare");
        if let Err(err) = self.append_configuration(conf, Responder::Change(tx)).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending configuration change");
        }
    }

    /// Handle the admin command assigning a role to a server.
    ///
    /// A promotion to a voting role first brings the target up-to-date through bounded
    /// catch-up rounds; the configuration change is submitted once a round completes
    /// within the election timeout.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_assign_role(&mut self, id: NodeId, role: ServerRole, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration(false) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let server = match self.core.configuration.get(id) {
            Some(server) => *server,
            None => {
                let _ = tx.send(Err(ChangeConfigError::NotFound(id).into()));
                return;
            }
        };
        if server.role == role {
            let _ = tx.send(Err(ChangeConfigError::BadRole { id, role }.into()));
            return;
        }

        let needs_catch_up = matches!(role, ServerRole::Voter | ServerRole::Logger) && !self.is_peer_up_to_date(id);
        if needs_catch_up {
            self.begin_catch_up(id, role, 0, tx).await;
            return;
        }

        let mut conf = self.core.configuration.clone();
        conf.set_role(id, role);
        tracing::info!(id = self.core.id, target = id, role = %role, "assigning role");
        if let Err(err) = self.append_configuration(conf, Responder::Change(tx)).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending configuration change");
        }
    }

    /// Handle the admin command promoting one server and removing another atomically
    /// through joint consensus.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_joint_promote(
        &mut self,
        id: NodeId,
        role: ServerRole,
        remove_id: NodeId,
        tx: ResponseTx,
    ) {
        if !matches!(role, ServerRole::Voter | ServerRole::Logger) {
            let _ = tx.send(Err(ChangeConfigError::BadRole { id, role }.into()));
            return;
        }
        if self.core.configuration.get(remove_id).is_none() {
            let _ = tx.send(Err(ChangeConfigError::NotFound(remove_id).into()));
            return;
        }
        if let Err(err) = self.can_change_configuration(false) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let server = match self.core.configuration.get(id) {
            Some(server) => *server,
            None => {
                let _ = tx.send(Err(ChangeConfigError::NotFound(id).into()));
                return;
            }
        };
        if server.role == role {
            let _ = tx.send(Err(ChangeConfigError::BadRole { id, role }.into()));
            return;
        }

        if !self.is_peer_up_to_date(id) {
            self.begin_catch_up(id, role, remove_id, tx).await;
            return;
        }

        let mut conf = self.core.configuration.clone();
        conf.joint_remove(remove_id);
        conf.set_role_new(id, role);
        tracing::info!(
            id = self.core.id,
            target = id,
            role = %role,
            remove = remove_id,
            "entering joint consensus"
        );
        if let Err(err) = self.append_configuration(conf, Responder::Change(tx)).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending joint configuration");
        }
    }

    /// Handle the admin command removing a server from the cluster.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_remove_server(&mut self, id: NodeId, tx: ResponseTx) {
        let joint = self.core.configuration.phase == ConfigurationPhase::Joint;
        if let Err(err) = self.can_change_configuration(joint) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let server = match self.core.configuration.get(id) {
            Some(server) => *server,
            None => {
                let _ = tx.send(Err(ChangeConfigError::BadId(id).into()));
                return;
            }
        };

        let conf = if joint {
            // Collapse to the group not containing the server, dropping it either way.
            let group = if server.group.contains(Group::NEW) { Group::OLD } else { Group::NEW };
            let mut conf = self.core.configuration.joint_to_normal(group);
            conf.remove(id);
            conf
        } else {
            let mut conf = self.core.configuration.clone();
            conf.remove(id);
            conf
        };

        if conf.voter_count(Group::ANY) == 0 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        tracing::info!(id = self.core.id, target = id, "removing server");
        if let Err(err) = self.append_configuration(conf, Responder::Change(tx)).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending configuration change");
        }
    }

    /// Handle the admin command re-appending the current configuration unchanged.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_duplicate_configuration(&mut self, tx: ResponseTx) {
        if let Err(err) = self.can_change_configuration(false) {
            let _ = tx.send(Err(err.into()));
            return;
        }
        let conf = self.core.configuration.clone();
        if let Err(err) = self.append_configuration(conf, Responder::Change(tx)).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending configuration change");
        }
    }

    /// Append a configuration change entry and start replicating it.
    ///
    /// The new configuration takes effect immediately: the progress array is rebuilt for
    /// it (preserving surviving peers) and quorum is computed against it from here on.
    pub(super) async fn append_configuration(
        &mut self,
        conf: Configuration,
        responder: Responder<D, R>,
    ) -> RaftResult<u64> {
        let old_conf = self.core.configuration.clone();
        let index = self.core.log.append_configuration(self.core.current_term, conf.clone());
        self.progress = self.progress.rebuild(&old_conf, &conf, self.core.log.last_index(), Instant::now());
        self.core.adopt_uncommitted_configuration(conf.clone(), index);

        let view = self.core.log.acquire(index, index);
        let refs: Vec<&crate::raft::Entry<D>> = view.iter().map(|entry| entry.as_ref()).collect();
        let res = self.core.storage.append_to_log(&refs).await;
        drop(view);
        if let Err(err) = res {
            self.core.log.discard(index);
            self.core.rollback_uncommitted_configuration();
            return Err(self.core.map_fatal_storage_error(err));
        }

        self.core.last_stored = index;
        if let Some(i) = conf.index_of(self.core.id) {
            self.progress.get_mut(i).maybe_update(index);
        }
        self.registry.enqueue(index, RequestKind::Change, responder);
        self.commit_and_replicate().await?;
        Ok(index)
    }

    /// Submit the follow-up CHANGE which collapses a committed joint configuration.
    pub(super) async fn submit_joint_collapse(&mut self) -> RaftResult<()> {
        if self.core.configuration.phase != ConfigurationPhase::Joint {
            return Ok(());
        }
        let collapsed = self.core.configuration.joint_to_normal(Group::NEW);
        tracing::info!(id = self.core.id, "joint configuration committed, collapsing to the new group");
        self.append_configuration(collapsed, Responder::None).await?;
        Ok(())
    }

    /// Whether the given peer's log is fully replicated.
    fn is_peer_up_to_date(&self, id: NodeId) -> bool {
        match self.core.configuration.index_of(id) {
            Some(i) => self.progress.get(i).match_index == self.core.log.last_index(),
            None => false,
        }
    }

    /// Start the first catch-up round for a promotion.
    async fn begin_catch_up(&mut self, id: NodeId, role: ServerRole, remove_id: NodeId, tx: ResponseTx) {
        self.promotee_id = id;
        self.promotee_role = role;
        self.remove_id = remove_id;
        self.round_number = 1;
        self.round_index = self.core.log.last_index();
        self.round_start = Instant::now();
        self.pending_promotion = Some(tx);
        tracing::info!(
            id = self.core.id,
            promotee = id,
            round_index = self.round_index,
            "starting catch-up round 1"
        );
        // Immediately initiate an AppendEntries request towards the promotee.
        self.replicate_to_peer(id).await;
    }

    /// Submit the configuration change for a caught-up promotee.
    pub(super) async fn submit_promotion(&mut self) -> RaftResult<()> {
        let id = self.promotee_id;
        let role = self.promotee_role;
        let remove_id = self.remove_id;
        let tx = self.pending_promotion.take();
        self.clear_promotion();

        let responder = match tx {
            Some(tx) => Responder::Change(tx),
            None => Responder::None,
        };

        let mut conf = self.core.configuration.clone();
        if remove_id != 0 {
            conf.joint_remove(remove_id);
            conf.set_role_new(id, role);
        } else {
            conf.set_role(id, role);
        }
        self.append_configuration(conf, responder).await?;
        Ok(())
    }

    /// Abort an in-flight catch-up, failing the originating request.
    pub(super) fn abort_promotion(&mut self) {
        let tx = self.pending_promotion.take();
        self.clear_promotion();
        if let Some(tx) = tx {
            let _ = tx.send(Err(ChangeConfigError::CatchUpFailed.into()));
        }
    }

    fn clear_promotion(&mut self) {
        self.promotee_id = 0;
        self.remove_id = 0;
        self.round_number = 0;
        self.round_index = 0;
    }

    /// Park an empty peer in the standby role while a snapshot brings it up to speed.
    ///
    /// Applies only to voting peers whose whole log has been compacted away on the
    /// leader, and only when a change may be proposed; otherwise the snapshot
    /// installation alone does the catching up.
    pub(super) async fn demote_empty_peer_to_standby(&mut self, id: NodeId) {
        let server = match self.core.configuration.get(id) {
            Some(server) => *server,
            None => return,
        };
        if server.role != ServerRole::Voter || self.can_change_configuration(false).is_err() {
            return;
        }
        tracing::info!(id = self.core.id, target = id, "parking empty voter in standby for snapshot catch-up");
        let mut conf = self.core.configuration.clone();
        conf.set_role(id, ServerRole::Standby);
        if let Err(err) = self.append_configuration(conf, Responder::None).await {
            tracing::error!({error=%err, id=self.core.id}, "error appending standby demotion");
        }
    }

    /// Find a suitable voting follower to transfer leadership to.
    fn select_transferee(&self) -> Option<NodeId> {
        let conf = &self.core.configuration;
        let last_index = self.core.log.last_index();
        let mut transferee = None;
        for (i, server) in conf.servers.iter().enumerate() {
            if server.id == self.core.id || !conf.is_voter(server, Group::ANY) {
                continue;
            }
            transferee = Some(server.id);
            if self.progress.get(i).is_up_to_date(last_index) {
                break;
            }
        }
        transferee
    }

    /// Handle the admin command transferring leadership to another voter.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_transfer_leadership(&mut self, target: NodeId, tx: TransferResponseTx) {
        if self.core.transfer.is_some() {
            let _ = tx.send(Err(TransferError::NodeNotLeader(Some(self.core.id))));
            return;
        }

        let target = if target == 0 {
            match self.select_transferee() {
                Some(id) => id,
                None => {
                    let _ = tx.send(Err(TransferError::NoTarget));
                    return;
                }
            }
        } else {
            target
        };

        let valid = target != self.core.id
            && match self.core.configuration.get(target) {
                Some(server) => self.core.configuration.is_voter(server, Group::ANY),
                None => false,
            };
        if !valid {
            let _ = tx.send(Err(TransferError::BadId(target)));
            return;
        }

        tracing::info!(id = self.core.id, transferee = target, "starting leadership transfer");
        self.core.transfer = Some(Transfer {
            id: target,
            deadline: Instant::now() + Duration::from_millis(2 * self.core.config.election_timeout_max),
            timeout_now_sent: false,
            tx: Some(tx),
        });

        // If the transferee is already up-to-date, TimeoutNow goes out right away;
        // otherwise it is sent once replication reports the transferee current.
        if let Some(i) = self.core.configuration.index_of(target) {
            self.evaluate_transfer(target, i);
            if self.progress.get(i).state != ProgressState::Snapshot {
                self.replicate_to_peer(target).await;
            }
        }
    }
}
