//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use cases are to
//! expose these metrics to a metrics collection system like Prometheus. Applications may
//! also use this data to trigger events within higher levels of the parent application.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which
//! will return a stream of metrics.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::Configuration;
use crate::LogId;
use crate::NodeId;

/// The per-follower replication state observed at a leader.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    /// The highest index known to be replicated on the follower.
    pub match_index: u64,
}

/// The metrics about the leader. It is only available when the node is in leader state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication targets.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
    /// Whether the leader's term barrier has committed, making reads linearizable.
    pub readable: bool,
}

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to have been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log to be applied to the state machine.
    pub last_applied: u64,
    /// The index of the highest log entry known to be committed.
    pub commit_index: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership configuration of the cluster.
    pub membership_config: Configuration,
    /// The identity of the last entry covered by the current snapshot.
    pub snapshot: LogId,
    /// The metrics about the leader. It is only Some() when this node is leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    /// Create the initial metrics payload for a node that has not loaded state yet.
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            membership_config: Configuration::new(),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

// Error variants related to metrics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait is a wrapper of a watch channel of RaftMetrics, which provides the
/// ability to wait for the metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();

            tracing::debug!("id={} wait {:} latest: {:?}", latest.id, msg.to_string(), latest);

            if func(&latest) {
                tracing::debug!("id={} done wait {:} latest: {:?}", latest.id, msg.to_string(), latest);
                return Ok(latest);
            }

            let delay = sleep_until(timeout_at);

            tokio::select! {
                _ = delay => {
                    tracing::debug!("id={} timeout wait {:} latest: {:?}", latest.id, msg.to_string(), latest);
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_applied` to become `want_log`(inclusive) or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log && x.last_applied >= want_log,
            &format!("{} .last_log_index+last_applied >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `current_term` to become `term` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_term(&self, term: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_term >= term,
            &format!("{} .current_term >= {}", msg.to_string(), term),
        )
        .await
    }

    /// Wait for `state` to become `want_state` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for `current_leader` to become `leader_id` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until the snapshot anchor reaches `want` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn snapshot(&self, want: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|x| x.snapshot == want, &format!("{} .snapshot -> {:?}", msg.to_string(), want)).await
    }
}
