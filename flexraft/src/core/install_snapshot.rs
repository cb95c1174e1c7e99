//! The follower side of snapshot installation.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to install a snapshot on this node, replacing its log (§7).
    ///
    /// The installation is acknowledged with an AppendEntries result whose
    /// `last_log_index` names the snapshot's last covered index, which advances this
    /// peer's match index on the leader.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If the message's term is stale, do not honor the request; the rejected hint
        // names the snapshot so the leader aborts the installation.
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.last_index,
                last_log_index: self.last_stored,
                pkt: 0,
            });
        }

        self.update_next_election_timeout(true);

        if req.term > self.current_term {
            self.update_current_term(req.term, Some(req.leader_id));
            self.save_hard_state().await?;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        // A snapshot at or below our commit point carries nothing new: the log already
        // covers it. Acknowledge so the leader falls back to log replication.
        if req.last_index <= self.commit_index {
            tracing::debug!(id = self.id, snapshot_index = req.last_index, "snapshot is stale, ignoring");
            self.report_metrics(Update::Ignore);
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: 0,
                last_log_index: self.last_stored,
                pkt: 0,
            });
        }

        let meta = SnapshotMeta {
            last_log_id: LogId {
                term: req.last_term,
                index: req.last_index,
            },
            membership: req.conf.clone(),
            membership_index: req.conf_index,
        };

        tracing::info!(id = self.id, snapshot_index = req.last_index, "installing snapshot");
        self.storage
            .install_snapshot(&meta, req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // The log is replaced by the snapshot anchor; replication resumes from there.
        self.log.restore(req.last_index, req.last_term);
        self.snapshot_last = meta.last_log_id;
        self.last_stored = req.last_index;
        self.last_applied = req.last_index;
        self.last_applying = req.last_index;
        self.commit_index = std::cmp::max(self.commit_index, req.last_index);

        // Adopt the configuration covered by the snapshot as committed.
        self.configuration = req.conf.clone();
        self.committed_configuration = req.conf;
        self.configuration_index = req.conf_index;
        self.configuration_uncommitted_index = 0;

        self.report_metrics(Update::Ignore);

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: req.last_index,
            pkt: 0,
        })
    }
}
