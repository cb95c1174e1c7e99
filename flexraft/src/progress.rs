//! Per-peer replication progress tracked by the leader.

use std::cmp::max;
use std::cmp::min;

use tokio::time::Duration;
use tokio::time::Instant;

use crate::membership::Configuration;
use crate::NodeId;

/// The replication mode towards a single peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProgressState {
    /// At most one in-flight probe per heartbeat interval, to discover the match point.
    Probe,
    /// Streaming entries optimistically, bounded by the in-flight window.
    Pipeline,
    /// A snapshot is being installed on the peer.
    Snapshot,
}

/// Replication bookkeeping for one peer.
#[derive(Clone, Debug)]
pub(crate) struct Progress {
    /// The index of the next entry to send.
    pub next_index: u64,
    /// The highest index known to be replicated on the peer.
    pub match_index: u64,
    /// The last index of the snapshot being installed, when in `Snapshot` state.
    pub snapshot_index: u64,
    /// The replication mode.
    pub state: ProgressState,
    /// When an AppendEntries was last sent to the peer, if ever.
    pub last_send: Option<Instant>,
    /// When the in-flight snapshot was sent to the peer.
    pub snapshot_last_send: Instant,
    /// Whether the peer responded since the last check-quorum sweep.
    pub recent_recv: bool,
    /// When the peer was last heard from.
    pub recent_recv_time: Instant,
}

impl Progress {
    pub fn new(last_index: u64, now: Instant) -> Self {
        Progress {
            next_index: last_index + 1,
            match_index: 0,
            snapshot_index: 0,
            state: ProgressState::Probe,
            last_send: None,
            snapshot_last_send: now,
            recent_recv: false,
            recent_recv_time: now,
        }
    }

    /// Whether the peer has acknowledged everything up to the given last log index.
    pub fn is_up_to_date(&self, last_index: u64) -> bool {
        self.next_index == last_index + 1
    }

    fn should_pipe_more(&self, inflight_log_threshold: u64) -> bool {
        if inflight_log_threshold == 0 {
            return true;
        }
        if self.next_index <= self.match_index {
            return true;
        }
        self.next_index - self.match_index - 1 < inflight_log_threshold
    }

    /// Decide whether an AppendEntries (or snapshot retry) should be sent now.
    ///
    /// In `Snapshot` state a timed-out installation is aborted here, falling the peer
    /// back to `Probe` so the send happens immediately.
    pub fn should_replicate(
        &mut self,
        now: Instant,
        last_index: u64,
        heartbeat_timeout: Duration,
        install_snapshot_timeout: Duration,
        inflight_log_threshold: u64,
    ) -> bool {
        debug_assert!(self.next_index <= last_index + 1);
        let needs_heartbeat = match self.last_send {
            Some(last_send) => now.saturating_duration_since(last_send) >= heartbeat_timeout,
            None => true,
        };
        match self.state {
            ProgressState::Snapshot => {
                if now.saturating_duration_since(self.snapshot_last_send) >= install_snapshot_timeout {
                    self.abort_snapshot();
                    true
                } else {
                    // Keep asserting leadership while the follower installs.
                    needs_heartbeat
                }
            }
            ProgressState::Probe => needs_heartbeat,
            ProgressState::Pipeline => {
                (!self.is_up_to_date(last_index) && self.should_pipe_more(inflight_log_threshold)) || needs_heartbeat
            }
        }
    }

    /// Apply a rejection hint from the peer, filtering out stale rejections.
    ///
    /// Returns true when the rejection was accepted and a resend should follow.
    pub fn maybe_decrement(&mut self, rejected: u64, peer_last_index: u64, log_last_index: u64) -> bool {
        match self.state {
            ProgressState::Snapshot => {
                // The rejection is stale or spurious unless it names the in-flight snapshot.
                if rejected != self.snapshot_index {
                    return false;
                }
                self.abort_snapshot();
                true
            }
            ProgressState::Pipeline => {
                // The rejection is stale if the rejected index is already matched.
                if rejected <= self.match_index {
                    if peer_last_index == 1 {
                        // The peer restarted with an empty log; start over.
                        *self = Progress::new(log_last_index, Instant::now());
                    }
                    return false;
                }
                self.next_index = min(rejected, self.match_index + 1);
                self.to_probe();
                true
            }
            ProgressState::Probe => {
                // The rejection is stale or spurious unless it names the probed index.
                if rejected != self.next_index - 1 {
                    return false;
                }
                self.next_index = min(rejected, peer_last_index + 1);
                self.next_index = max(self.next_index, 1);
                true
            }
        }
    }

    /// Advance the match index, returning whether it moved.
    pub fn maybe_update(&mut self, last_index: u64) -> bool {
        let mut updated = false;
        if self.match_index < last_index {
            self.match_index = last_index;
            updated = true;
        }
        if self.next_index < last_index + 1 {
            self.next_index = last_index + 1;
        }
        updated
    }

    /// Optimistically advance `next_index` after a pipelined send.
    pub fn optimistic_next_index(&mut self, next_index: u64) {
        self.next_index = next_index;
    }

    pub fn to_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            // The pending snapshot reached the peer, probe from right after it.
            debug_assert!(self.snapshot_index > 0);
            self.next_index = max(self.match_index + 1, self.snapshot_index);
            self.snapshot_index = 0;
        } else {
            self.next_index = self.match_index + 1;
        }
        self.next_index = max(self.next_index, 1);
        self.state = ProgressState::Probe;
    }

    pub fn to_pipeline(&mut self) {
        self.state = ProgressState::Pipeline;
    }

    pub fn to_snapshot(&mut self, snapshot_index: u64, now: Instant) {
        self.state = ProgressState::Snapshot;
        self.snapshot_index = snapshot_index;
        self.snapshot_last_send = now;
    }

    pub fn abort_snapshot(&mut self) {
        self.snapshot_index = 0;
        self.state = ProgressState::Probe;
    }

    /// Whether the in-flight snapshot has been fully acknowledged.
    pub fn snapshot_done(&self) -> bool {
        debug_assert_eq!(self.state, ProgressState::Snapshot);
        self.match_index >= self.snapshot_index
    }

    /// Clear and return the recent-recv flag, as part of the check-quorum sweep.
    pub fn reset_recent_recv(&mut self) -> bool {
        std::mem::replace(&mut self.recent_recv, false)
    }

    pub fn mark_recent_recv(&mut self, now: Instant) {
        self.recent_recv = true;
        self.recent_recv_time = now;
    }
}

/// The leader's progress entries, parallel to the configuration's server list.
///
/// Only the leader owns one of these; it is rebuilt on every configuration change,
/// preserving the entries of servers present in both the old and the new configuration.
#[derive(Debug)]
pub(crate) struct ProgressSet {
    entries: Vec<Progress>,
}

impl ProgressSet {
    /// Build a fresh progress array for the given configuration.
    ///
    /// The leader's own slot starts with `match_index = last_stored`.
    pub fn build(conf: &Configuration, last_index: u64, last_stored: u64, own_id: NodeId, now: Instant) -> Self {
        let mut entries = Vec::with_capacity(conf.servers.len());
        for server in conf.servers.iter() {
            let mut progress = Progress::new(last_index, now);
            if server.id == own_id {
                progress.match_index = last_stored;
            }
            entries.push(progress);
        }
        ProgressSet { entries }
    }

    /// Rebuild the progress array for a new configuration, preserving the state of
    /// servers present in both.
    pub fn rebuild(&self, old_conf: &Configuration, new_conf: &Configuration, last_index: u64, now: Instant) -> Self {
        let mut entries = Vec::with_capacity(new_conf.servers.len());
        for server in new_conf.servers.iter() {
            match old_conf.index_of(server.id) {
                Some(old_idx) => entries.push(self.entries[old_idx].clone()),
                None => entries.push(Progress::new(last_index, now)),
            }
        }
        ProgressSet { entries }
    }

    pub fn get(&self, i: usize) -> &Progress {
        &self.entries[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut Progress {
        &mut self.entries[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Progress> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::membership::ServerRole;

    use super::*;

    const HEARTBEAT: Duration = Duration::from_millis(50);
    const INSTALL_TIMEOUT: Duration = Duration::from_millis(200);

    fn progress(last_index: u64) -> Progress {
        Progress::new(last_index, Instant::now())
    }

    #[test]
    fn test_new_progress_starts_probing() {
        let p = progress(7);
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 8);
        assert_eq!(p.match_index, 0);
    }

    #[test]
    fn test_probe_sends_once_per_heartbeat() {
        let now = Instant::now();
        let mut p = progress(5);
        assert!(p.should_replicate(now, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
        p.last_send = Some(now);
        assert!(!p.should_replicate(now, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
        assert!(p.should_replicate(now + HEARTBEAT, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
    }

    #[test]
    fn test_pipeline_sends_when_behind() {
        let now = Instant::now();
        let mut p = progress(5);
        p.to_pipeline();
        p.last_send = Some(now);
        // Up to date: heartbeat pacing only.
        assert!(!p.should_replicate(now, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
        // New entries appended: send immediately.
        assert!(p.should_replicate(now, 9, HEARTBEAT, INSTALL_TIMEOUT, 0));
    }

    #[test]
    fn test_pipeline_respects_inflight_window() {
        let now = Instant::now();
        let mut p = progress(5);
        p.to_pipeline();
        p.last_send = Some(now);
        p.match_index = 2;
        p.next_index = 6;
        // 3 entries in flight with a window of 3: heartbeat pacing only.
        assert!(!p.should_replicate(now, 9, HEARTBEAT, INSTALL_TIMEOUT, 3));
        // A wider window permits more.
        assert!(p.should_replicate(now, 9, HEARTBEAT, INSTALL_TIMEOUT, 10));
        // Threshold 0 disables the cap.
        assert!(p.should_replicate(now, 9, HEARTBEAT, INSTALL_TIMEOUT, 0));
    }

    #[test]
    fn test_snapshot_aborts_after_install_timeout() {
        let now = Instant::now();
        let mut p = progress(5);
        p.to_snapshot(4, now);
        p.snapshot_last_send = now;
        p.last_send = Some(now);
        assert!(!p.should_replicate(now, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
        assert_eq!(p.state, ProgressState::Snapshot);

        assert!(p.should_replicate(now + INSTALL_TIMEOUT, 5, HEARTBEAT, INSTALL_TIMEOUT, 0));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn test_maybe_decrement_probe_filters_stale() {
        let mut p = progress(9);
        // next_index is 10; only a rejection of 9 is current.
        assert!(!p.maybe_decrement(5, 9, 9));
        assert!(p.maybe_decrement(9, 3, 9));
        assert_eq!(p.next_index, 4);
    }

    #[test]
    fn test_maybe_decrement_pipeline() {
        let mut p = progress(9);
        p.to_pipeline();
        p.match_index = 6;
        p.next_index = 10;
        // Stale: rejection below the match point.
        assert!(!p.maybe_decrement(5, 9, 9));
        assert_eq!(p.state, ProgressState::Pipeline);
        // Current: fall back to probing from min(rejected, match + 1).
        assert!(p.maybe_decrement(8, 9, 9));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 7);
    }

    #[test]
    fn test_maybe_decrement_pipeline_restarted_peer() {
        let mut p = progress(9);
        p.to_pipeline();
        p.match_index = 6;
        p.next_index = 10;
        // A stale rejection from a peer that reports an empty log resets progress.
        assert!(!p.maybe_decrement(1, 1, 9));
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 10);
        assert_eq!(p.match_index, 0);
    }

    #[test]
    fn test_maybe_decrement_snapshot() {
        let mut p = progress(9);
        p.to_snapshot(7, Instant::now());
        assert!(!p.maybe_decrement(3, 9, 9));
        assert_eq!(p.state, ProgressState::Snapshot);
        assert!(p.maybe_decrement(7, 9, 9));
        assert_eq!(p.state, ProgressState::Probe);
    }

    #[test]
    fn test_maybe_update_is_monotone() {
        let mut p = progress(9);
        assert!(p.maybe_update(4));
        assert_eq!(p.match_index, 4);
        assert!(!p.maybe_update(3));
        assert_eq!(p.match_index, 4);
        assert_eq!(p.next_index, 10);
        assert!(p.maybe_update(12));
        assert_eq!(p.next_index, 13);
    }

    #[test]
    fn test_snapshot_done_then_probe_resumes_after_anchor() {
        let mut p = progress(9);
        p.to_snapshot(7, Instant::now());
        assert!(!p.snapshot_done());
        p.maybe_update(7);
        assert!(p.snapshot_done());
        p.to_probe();
        assert_eq!(p.next_index, 8);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn test_build_set_marks_own_match() {
        let conf = Configuration::with_voters(vec![1, 2, 3]);
        let set = ProgressSet::build(&conf, 9, 9, 1, Instant::now());
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(0).match_index, 9);
        assert_eq!(set.get(1).match_index, 0);
    }

    #[test]
    fn test_rebuild_preserves_surviving_peers() {
        let old = Configuration::with_voters(vec![1, 2, 3]);
        let mut set = ProgressSet::build(&old, 9, 9, 1, Instant::now());
        set.get_mut(1).match_index = 7;
        set.get_mut(1).to_pipeline();

        let mut new = Configuration::with_voters(vec![1, 2]);
        new.add(4, ServerRole::Spare).unwrap();
        let rebuilt = set.rebuild(&old, &new, 9, Instant::now());

        assert_eq!(rebuilt.len(), 3);
        // Server 2 keeps its progress.
        assert_eq!(rebuilt.get(1).match_index, 7);
        assert_eq!(rebuilt.get(1).state, ProgressState::Pipeline);
        // Server 4 starts fresh.
        assert_eq!(rebuilt.get(2).match_index, 0);
        assert_eq!(rebuilt.get(2).state, ProgressState::Probe);
    }
}
