//! The follower side of log replication.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An invoked Raft RPC to append entries, sent by the cluster leader (§5.3), also
    /// used as a heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // Reply false if the term is out of date (§5.1), hinting the rejected index.
        if req.term < self.current_term {
            tracing::debug!(id = self.id, "append entries from a stale term, rejecting");
            return Ok(self.append_entries_rejection(req.prev_log_index, req.pkt));
        }

        // A valid AppendEntries from the current leader: reset the election timer.
        self.update_next_election_timeout(true);

        if req.term > self.current_term {
            self.update_current_term(req.term, Some(req.leader_id));
            self.save_hard_state().await?;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            self.report_metrics(Update::Ignore);
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        // Log-matching check (§5.3): the entry at prev_log_index must carry
        // prev_log_term.
        let mut skip = 0usize;
        if req.prev_log_index > 0 {
            if req.prev_log_index < self.log.snapshot_index() {
                // The prefix is below our snapshot and therefore committed and matching;
                // only entries above the anchor are new.
                skip = (self.log.snapshot_index() - req.prev_log_index).min(req.entries.len() as u64) as usize;
            } else {
                let local_term = self.log.term_of(req.prev_log_index);
                if local_term != req.prev_log_term {
                    if req.prev_log_index <= self.commit_index {
                        // A mismatch at or below the commit index violates the Log
                        // Matching property for committed entries.
                        return Err(self.fatal_safety_violation("log mismatch at a committed index"));
                    }
                    tracing::debug!(
                        id = self.id,
                        prev_log_index = req.prev_log_index,
                        prev_log_term = req.prev_log_term,
                        local_term,
                        "log mismatch, rejecting"
                    );
                    return Ok(self.append_entries_rejection(req.prev_log_index, req.pkt));
                }
            }
        }

        // Walk the incoming entries, skipping those we already hold and truncating at
        // the first conflict.
        let mut offset = skip;
        while offset < req.entries.len() {
            let entry = &req.entries[offset];
            let index = entry.log_id.index;
            let local_term = self.log.term_of(index);
            if local_term == 0 {
                // No local entry here: everything from this point on is new.
                break;
            }
            if local_term != entry.log_id.term {
                self.delete_conflicting_entries(index).await?;
                break;
            }
            offset += 1;
        }

        let new_entries = &req.entries[offset..];
        if !new_entries.is_empty() {
            self.append_from_leader(new_entries).await?;
        }

        // Even a pure heartbeat advances the commit index and applies (§5.3).
        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_stored);
            // Followers have no request registry: committed results surface on the
            // leader which accepted the requests.
            let _ = self.apply_committed().await?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.last_stored,
            pkt: req.pkt,
        })
    }

    fn append_entries_rejection(&self, rejected: u64, pkt: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            rejected,
            last_log_index: self.last_stored,
            pkt,
        }
    }

    /// Truncate the log from the first conflicting index, durably and in memory.
    async fn delete_conflicting_entries(&mut self, from: u64) -> RaftResult<()> {
        if from <= self.commit_index {
            return Err(self.fatal_safety_violation("conflicting entry at or below the commit index"));
        }
        tracing::debug!(id = self.id, from, "truncating conflicting entries");

        // A conflicting uncommitted configuration change is rolled back to the last
        // committed configuration.
        if self.configuration_uncommitted_index >= from {
            self.rollback_uncommitted_configuration();
        }

        // The in-memory truncation goes first: it is the one that can be refused while
        // entries are referenced by in-flight I/O, and memory and disk must not diverge.
        self.log.truncate(from).map_err(|err| match err {
            // The request is dropped and the leader retries on its next heartbeat.
            RaftError::LogBusy => RaftError::Busy,
            err => err,
        })?;
        self.storage.delete_logs_from(from).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if self.last_stored >= from {
            self.last_stored = from - 1;
        }
        Ok(())
    }

    /// Append entries received from the leader: in memory first, then durably.
    async fn append_from_leader(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let first = entries[0].log_id.index;
        let last = entries[entries.len() - 1].log_id.index;
        debug_assert_eq!(first, self.log.last_index() + 1);

        for entry in entries {
            self.log.append_entry(entry.clone());
        }

        let view = self.log.acquire(first, last);
        let refs: Vec<&Entry<D>> = view.iter().map(|entry| entry.as_ref()).collect();
        let res = self.storage.append_to_log(&refs).await;
        drop(view);
        if let Err(err) = res {
            self.log.discard(first);
            return Err(self.map_fatal_storage_error(err));
        }
        self.last_stored = std::cmp::max(self.last_stored, last);

        // Surface any configuration change carried by the new entries: it takes effect
        // as soon as it is stored, before commitment.
        for entry in entries {
            if let EntryPayload::ConfigChange(change) = &entry.payload {
                self.adopt_uncommitted_configuration(change.configuration.clone(), entry.log_id.index);
            }
        }
        Ok(())
    }
}
