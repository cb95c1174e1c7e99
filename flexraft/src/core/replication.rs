//! The leader side of log replication.
//!
//! Replication is driven by the leader's progress entries: client requests, heartbeat
//! ticks and peer responses all funnel into `replicate_to_peer`, which decides per peer
//! whether to probe, stream entries, or install a snapshot. Sends are spawned as
//! fire-and-await tasks whose completions re-enter the leader loop as `ReplicaEvent`s,
//! so every progress mutation happens on the node's single state-machine task.

use std::sync::Arc;

use rand::random;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::metrics::ReplicationMetrics;
use crate::progress::ProgressState;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// An event coming from an in-flight replication RPC.
pub(crate) enum ReplicaEvent {
    /// The peer responded to an AppendEntries or InstallSnapshot RPC.
    Response {
        target: NodeId,
        response: AppendEntriesResponse,
    },
    /// The RPC could not be delivered or timed out.
    SendFailed { target: NodeId },
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::Response { target, response } => {
                format!("Response: target: {}, {}", target, response.summary())
            }
            ReplicaEvent::SendFailed { target } => format!("SendFailed: target: {}", target),
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Trigger replication towards every peer that is due for it.
    ///
    /// Spare servers are skipped unless they are the active promotee.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn replication_trigger(&mut self) {
        let targets: Vec<NodeId> = self.core.configuration.servers.iter().map(|s| s.id).collect();
        for target in targets {
            self.replicate_to_peer(target).await;
        }
    }

    /// The heartbeat sweep; identical to a replication trigger, the per-peer pacing
    /// lives in the progress entries.
    pub(super) async fn replication_heartbeat(&mut self) {
        self.replication_trigger().await;
    }

    /// Send the next AppendEntries or snapshot to a single peer, if its progress
    /// warrants one.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn replicate_to_peer(&mut self, target: NodeId) {
        if target == self.core.id {
            return;
        }
        let i = match self.core.configuration.index_of(target) {
            Some(i) => i,
            None => return,
        };
        let server = self.core.configuration.servers[i];
        if self.core.configuration.is_spare(&server) && server.id != self.promotee_id {
            return;
        }

        let now = Instant::now();
        let last_index = self.core.log.last_index();
        let heartbeat = Duration::from_millis(self.core.config.heartbeat_interval);
        let install_timeout = Duration::from_millis(self.core.config.install_snapshot_timeout);
        let inflight = self.core.config.inflight_log_threshold;

        if !self.progress.get_mut(i).should_replicate(now, last_index, heartbeat, install_timeout, inflight) {
            return;
        }

        if self.progress.get(i).state == ProgressState::Snapshot {
            // The peer is still installing; keep asserting leadership with a plain
            // heartbeat. Its likely rejection is filtered by the stale-rejection rules.
            self.send_heartbeat_frame(i, now);
            return;
        }

        let next_index = self.progress.get(i).next_index;
        if next_index == 1 && self.core.log.snapshot_index() > 0 {
            // The peer misses the entire log and a snapshot is the only anchor; schedule
            // parking it in the standby role while the snapshot brings it up to speed.
            if !self.pending_demotions.contains(&target) {
                self.pending_demotions.push(target);
            }
            self.send_snapshot(target, now).await;
            return;
        }

        let (prev_log_index, prev_log_term) = if next_index == 1 {
            (0, 0)
        } else {
            (next_index - 1, self.core.log.term_of(next_index - 1))
        };
        if prev_log_index > 0 && prev_log_term == 0 {
            // The entry preceding next_index has been compacted away.
            self.send_snapshot(target, now).await;
            return;
        }

        let to = last_index.min(next_index + self.core.config.max_payload_entries - 1);
        let view = self.core.log.acquire(next_index, to);
        let n_entries = view.len() as u64;

        let rpc = AppendEntriesRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
            prev_log_index,
            prev_log_term,
            entries: view.iter().map(|entry| entry.as_ref().clone()).collect(),
            leader_commit: self.core.commit_index,
            pkt: random(),
        };

        let p = self.progress.get_mut(i);
        p.last_send = Some(now);
        if p.state == ProgressState::Pipeline && n_entries > 0 {
            p.optimistic_next_index(next_index + n_entries);
        }

        self.spawn_append_entries(target, rpc, view);
    }

    /// Send an empty AppendEntries frame without touching the progress state machine.
    fn send_heartbeat_frame(&mut self, i: usize, now: Instant) {
        let target = self.core.configuration.servers[i].id;
        let next_index = self.progress.get(i).next_index;
        let prev_log_index = next_index.saturating_sub(1);
        let rpc = AppendEntriesRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
            prev_log_index,
            prev_log_term: self.core.log.term_of(prev_log_index),
            entries: Vec::new(),
            leader_commit: self.core.commit_index,
            pkt: random(),
        };
        self.progress.get_mut(i).last_send = Some(now);
        self.spawn_append_entries(target, rpc, Vec::new());
    }

    /// Spawn the actual RPC; the acquired log view is held until the send resolves so
    /// that truncation stays ordered after the in-flight I/O.
    fn spawn_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>, view: Vec<Arc<Entry<D>>>) {
        let network = self.core.network.clone();
        let tx = self.replication_tx.clone();
        let ttl = if rpc.entries.is_empty() {
            Duration::from_millis(self.core.config.heartbeat_interval)
        } else {
            Duration::from_millis(self.core.config.election_timeout_min)
        };
        tokio::spawn(
            async move {
                let res = timeout(ttl, network.send_append_entries(target, rpc)).await;
                drop(view);
                let event = match res {
                    Ok(Ok(response)) => ReplicaEvent::Response { target, response },
                    Ok(Err(err)) => {
                        tracing::warn!({error=%err, target}, "error sending AppendEntries RPC to target");
                        ReplicaEvent::SendFailed { target }
                    }
                    Err(_) => {
                        tracing::warn!({target}, "timeout while sending AppendEntries RPC to target");
                        ReplicaEvent::SendFailed { target }
                    }
                };
                let _ = tx.send((event, tracing::debug_span!("CH")));
            }
            .instrument(tracing::debug_span!("send-append-entries")),
        );
    }

    /// Ship the current snapshot to the peer, moving its progress to `Snapshot` state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn send_snapshot(&mut self, target: NodeId, now: Instant) {
        let snapshot = match self.core.storage.get_current_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                // Nothing to ship yet; force a build and retry on a later heartbeat.
                self.core.trigger_log_compaction_if_needed(true);
                return;
            }
            Err(err) => {
                let _ = self.core.map_fatal_storage_error(err);
                return;
            }
        };

        let i = match self.core.configuration.index_of(target) {
            Some(i) => i,
            None => return,
        };
        let p = self.progress.get_mut(i);
        p.to_snapshot(snapshot.meta.last_log_id.index, now);
        p.last_send = Some(now);

        let rpc = InstallSnapshotRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
            last_index: snapshot.meta.last_log_id.index,
            last_term: snapshot.meta.last_log_id.term,
            conf_index: snapshot.meta.membership_index,
            conf: snapshot.meta.membership.clone(),
            data: snapshot.data,
        };

        let network = self.core.network.clone();
        let tx = self.replication_tx.clone();
        let ttl = Duration::from_millis(self.core.config.install_snapshot_timeout);
        tokio::spawn(
            async move {
                let res = timeout(ttl, network.send_install_snapshot(target, rpc)).await;
                let event = match res {
                    Ok(Ok(response)) => ReplicaEvent::Response { target, response },
                    Ok(Err(err)) => {
                        tracing::warn!({error=%err, target}, "error sending InstallSnapshot RPC to target");
                        ReplicaEvent::SendFailed { target }
                    }
                    Err(_) => {
                        tracing::warn!({target}, "timeout while sending InstallSnapshot RPC to target");
                        ReplicaEvent::SendFailed { target }
                    }
                };
                let _ = tx.send((event, tracing::debug_span!("CH")));
            }
            .instrument(tracing::debug_span!("send-install-snapshot")),
        );
    }

    /// Handle an event from an in-flight replication RPC.
    #[tracing::instrument(level = "trace", skip(self, event), fields(event=%event.summary()))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::Response { target, response } => self.replication_update(target, response).await,
            ReplicaEvent::SendFailed { target } => {
                if let Some(i) = self.core.configuration.index_of(target) {
                    let p = self.progress.get_mut(i);
                    match p.state {
                        ProgressState::Snapshot => p.abort_snapshot(),
                        _ => p.to_probe(),
                    }
                }
                Ok(())
            }
        }
    }

    /// Handle a peer's AppendEntries (or snapshot acknowledgement) response.
    #[tracing::instrument(level = "trace", skip(self, result), fields(target, result=%result.summary()))]
    pub(super) async fn replication_update(&mut self, target: NodeId, result: AppendEntriesResponse) -> RaftResult<()> {
        let i = match self.core.configuration.index_of(target) {
            Some(i) => i,
            None => return Ok(()),
        };
        let now = Instant::now();
        self.progress.get_mut(i).mark_recent_recv(now);

        // A newer term deposes this leader.
        if result.term > self.core.current_term {
            tracing::debug!(id = self.core.id, target, term = result.term, "newer term observed, stepping down");
            self.core.update_current_term(result.term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        // A rejection rewinds next_index, unless the stale-rejection filters drop it.
        if result.rejected > 0 {
            let log_last_index = self.core.log.last_index();
            if self.progress.get_mut(i).maybe_decrement(result.rejected, result.last_log_index, log_last_index) {
                self.replicate_to_peer(target).await;
            }
            return Ok(());
        }

        // The peer may report a longer log than ours, a leftover from previous terms.
        let last_index = std::cmp::min(result.last_log_index, self.core.log.last_index());
        if !self.progress.get_mut(i).maybe_update(last_index) {
            return Ok(());
        }

        match self.progress.get(i).state {
            ProgressState::Snapshot => {
                if self.progress.get(i).snapshot_done() {
                    self.progress.get_mut(i).to_probe();
                }
            }
            ProgressState::Probe => self.progress.get_mut(i).to_pipeline(),
            ProgressState::Pipeline => {}
        }

        self.leader_metrics.replication.insert(target, ReplicationMetrics {
            match_index: self.progress.get(i).match_index,
        });

        // Check if some new entries reached quorum.
        self.quorum_commit_and_apply().await?;

        // Applying a configuration change may have deposed us.
        if !self.core.target_state.is_leader() {
            return Ok(());
        }

        self.evaluate_catch_up_round(target).await?;
        if !self.core.target_state.is_leader() {
            return Ok(());
        }

        // The configuration (and with it the peer's index) may have changed under us.
        if let Some(i) = self.core.configuration.index_of(target) {
            self.evaluate_transfer(target, i);

            // A pipelined follower gets its next payload right away.
            if self.progress.get(i).state == ProgressState::Pipeline {
                self.replicate_to_peer(target).await;
            }
        }
        Ok(())
    }

    /// Advance the commit index by voter quorum and run the apply pipeline.
    ///
    /// The commit index becomes the largest index replicated on a strict majority of
    /// voters in every active group, gated on that entry carrying the current term
    /// (§5.4.2): entries from prior terms commit only transitively.
    pub(super) async fn quorum_commit_and_apply(&mut self) -> RaftResult<()> {
        let new_commit = self.quorum_commit_index();
        if new_commit > self.core.commit_index {
            self.core.commit_index = std::cmp::min(new_commit, self.core.last_stored);
            let applied = self.core.apply_committed().await?;
            self.dispatch_applied(applied);
        }
        Ok(())
    }

    fn quorum_commit_index(&self) -> u64 {
        let conf = &self.core.configuration;
        let mut candidate = u64::MAX;
        for group in conf.active_groups() {
            let mut matches: Vec<u64> = conf
                .servers
                .iter()
                .enumerate()
                .filter(|(_, s)| conf.is_voter(s, *group))
                .map(|(i, _)| self.progress.get(i).match_index)
                .collect();
            if matches.is_empty() {
                return self.core.commit_index;
            }
            matches.sort_unstable();
            let majority = quorum::majority_of(matches.len());
            candidate = candidate.min(matches[matches.len() - majority]);
        }
        if candidate == u64::MAX {
            return self.core.commit_index;
        }
        if candidate > self.core.commit_index && self.core.log.term_of(candidate) == self.core.current_term {
            candidate
        } else {
            self.core.commit_index
        }
    }

    /// Evaluate the catch-up round of the active promotee after a successful response.
    ///
    /// A round completes when the promotee's match index reaches the index recorded at
    /// the round's start. If it completed within an election timeout the promotee is
    /// caught up and the configuration change is submitted; otherwise another round
    /// starts, up to the configured bound.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn evaluate_catch_up_round(&mut self, target: NodeId) -> RaftResult<()> {
        if self.promotee_id == 0 || target != self.promotee_id {
            return Ok(());
        }
        let i = match self.core.configuration.index_of(target) {
            Some(i) => i,
            None => return Ok(()),
        };
        if self.progress.get(i).match_index < self.round_index {
            return Ok(());
        }

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.round_start);
        if elapsed <= Duration::from_millis(self.core.config.election_timeout_min) {
            tracing::info!(
                id = self.core.id,
                promotee = target,
                round = self.round_number,
                "promotee caught up, submitting configuration change"
            );
            self.submit_promotion().await?;
        } else if self.round_number >= self.core.config.max_catch_up_rounds {
            tracing::warn!(id = self.core.id, promotee = target, "promotee failed to catch up, aborting");
            self.abort_promotion();
        } else {
            self.round_number += 1;
            self.round_index = self.core.log.last_index();
            self.round_start = now;
        }
        Ok(())
    }

    /// The deadline sweep for a stalled catch-up, run from the heartbeat tick.
    pub(super) fn evaluate_catch_up_round_deadline(&mut self) {
        if self.promotee_id == 0 {
            return;
        }
        let bound = self.core.config.max_catch_up_rounds * self.core.config.election_timeout_max;
        if Instant::now().saturating_duration_since(self.round_start) > Duration::from_millis(bound) {
            tracing::warn!(id = self.core.id, promotee = self.promotee_id, "catch-up made no progress, aborting");
            self.abort_promotion();
        }
    }

    /// Send TimeoutNow once the transferee's log is current.
    pub(super) fn evaluate_transfer(&mut self, target: NodeId, i: usize) {
        let last_index = self.core.log.last_index();
        let up_to_date = self.progress.get(i).is_up_to_date(last_index);
        let (term, leader_id, last_log_term) = (self.core.current_term, self.core.id, self.core.log.last_term());

        if let Some(transfer) = self.core.transfer.as_mut() {
            if transfer.id != target || transfer.timeout_now_sent || !up_to_date {
                return;
            }
            transfer.timeout_now_sent = true;
            tracing::info!(id = leader_id, transferee = target, "transferee is up-to-date, sending TimeoutNow");
            let rpc = TimeoutNowRequest {
                term,
                leader_id,
                last_log_index: last_index,
                last_log_term,
            };
            let network = self.core.network.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = network.send_timeout_now(target, rpc).await {
                        tracing::warn!({error=%err, target}, "error sending TimeoutNow RPC to target");
                    }
                }
                .instrument(tracing::debug_span!("send-timeout-now")),
            );
        }
    }

    /// Step down if this leader has not heard from a quorum of voters within the last
    /// election interval.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn evaluate_check_quorum(&mut self) {
        let now = Instant::now();
        let interval = Duration::from_millis(self.core.config.election_timeout_min);
        if now.saturating_duration_since(self.last_quorum_check) < interval {
            return;
        }
        self.last_quorum_check = now;

        // Sweep the recent-recv flags once, then count them per group.
        let mut recent = vec![false; self.progress.len()];
        for (i, flag) in recent.iter_mut().enumerate() {
            *flag = self.progress.get_mut(i).reset_recent_recv();
        }

        let conf = &self.core.configuration;
        for group in conf.active_groups() {
            let mut total = 0usize;
            let mut alive = 0usize;
            for (i, server) in conf.servers.iter().enumerate() {
                if !conf.is_voter(server, *group) {
                    continue;
                }
                total += 1;
                if server.id == self.core.id || recent[i] {
                    alive += 1;
                }
            }
            if total > 0 && alive < quorum::majority_of(total) {
                tracing::warn!(id = self.core.id, "lost contact with a quorum of voters, stepping down");
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compute the group commit candidate the way quorum_commit_index does for a single
    // group, from a list of match indexes.
    fn group_candidate(mut matches: Vec<u64>) -> u64 {
        matches.sort_unstable();
        let majority = quorum::majority_of(matches.len());
        matches[matches.len() - majority]
    }

    macro_rules! test_group_candidate {
        ($name:ident, $expected:literal, $matches:expr) => {
            #[test]
            fn $name() {
                assert_eq!(group_candidate($matches), $expected);
            }
        };
    }

    test_group_candidate!(single_voter, 100, vec![100]);
    test_group_candidate!(three_voters_majority, 10, vec![20, 5, 10]);
    test_group_candidate!(three_voters_one_behind, 100, vec![0, 100, 100]);
    test_group_candidate!(even_number_of_voters_needs_strict_majority, 0, vec![0, 100, 0, 100]);
    test_group_candidate!(five_voters, 15, vec![20, 5, 0, 15, 15]);
    test_group_candidate!(seven_voters_majority_wins, 100, vec![0, 100, 0, 100, 0, 100, 100]);
}
