//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold for when to trigger a snapshot.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default timeout for sending a snapshot to a follower, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default number of log entries to keep below a new snapshot's last index.
pub const DEFAULT_SNAPSHOT_TRAILING: u64 = 128;
/// Default cap on unacknowledged in-flight entries per pipelined follower (0 disables the cap).
pub const DEFAULT_INFLIGHT_LOG_THRESHOLD: u64 = 0;
/// Default bound on catch-up rounds for servers being promoted to a voting role.
pub const DEFAULT_MAX_CATCH_UP_ROUNDS: u64 = 10;
/// Default number of entries applied to the state machine per apply batch.
pub const DEFAULT_MAX_APPLIED_BATCH: u64 = 64;

/// The policy to use for automatically triggering snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low latency between
/// zones. These values should typically be made configurable from the perspective of the
/// application which is being built on top of Raft.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Debug, Clone)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// Defaults to 50 milliseconds.
    ///
    /// **NOTE WELL:** it is very important that this value be greater than the amount of time
    /// it will take on average for heartbeat frames to be sent between nodes. No data processing
    /// is performed for heartbeats, so the main item of concern here is network latency. This
    /// value is also used as the default timeout for sending heartbeats.
    pub heartbeat_interval: u64,
    /// The timeout in milliseconds for a snapshot installation on a follower.
    ///
    /// If the follower has not acknowledged the snapshot within this window, the leader aborts
    /// the installation and falls back to probing the follower.
    pub install_snapshot_timeout: u64,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    pub max_payload_entries: u64,
    /// The cap on unacknowledged in-flight entries towards a pipelined follower.
    ///
    /// While a follower has this many entries in flight, the leader falls back to
    /// heartbeat-paced sends. `0` disables the cap.
    pub inflight_log_threshold: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The number of log entries to keep below a freshly taken snapshot's last index.
    ///
    /// Keeping a short trailing window lets slightly lagging followers catch up from the log
    /// instead of receiving a full snapshot.
    pub snapshot_trailing: u64,
    /// The bound on catch-up rounds granted to a server being promoted to a voting role.
    pub max_catch_up_rounds: u64,
    /// The maximum number of committed entries applied to the state machine per batch.
    pub max_applied_batch: u64,
    /// Whether candidates probe the cluster with a pre-vote round before bumping their term.
    pub pre_vote: bool,
    /// Whether a new leader appends a barrier entry on election win.
    ///
    /// The leader only reports itself readable for linearizable reads once that barrier
    /// has committed.
    pub no_op: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    ///
    /// The name of the Raft cluster. Does not influence the Raft internals, but is used for
    /// tracing.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            install_snapshot_timeout: None,
            max_payload_entries: None,
            inflight_log_threshold: None,
            snapshot_policy: None,
            snapshot_trailing: None,
            max_catch_up_rounds: None,
            max_applied_batch: None,
            pre_vote: None,
            no_op: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The interval at which leaders will send heartbeats to followers to avoid election timeout.
    pub heartbeat_interval: Option<u64>,
    /// The timeout for a snapshot installation on a follower, in milliseconds.
    pub install_snapshot_timeout: Option<u64>,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    pub max_payload_entries: Option<u64>,
    /// The cap on unacknowledged in-flight entries towards a pipelined follower.
    pub inflight_log_threshold: Option<u64>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// The number of log entries to keep below a freshly taken snapshot.
    pub snapshot_trailing: Option<u64>,
    /// The bound on catch-up rounds for promotions.
    pub max_catch_up_rounds: Option<u64>,
    /// The maximum number of committed entries applied per batch.
    pub max_applied_batch: Option<u64>,
    /// Whether to run a pre-vote round before real elections.
    pub pre_vote: Option<bool>,
    /// Whether a new leader appends a barrier entry on election win.
    pub no_op: Option<bool>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `inflight_log_threshold`.
    pub fn inflight_log_threshold(mut self, val: u64) -> Self {
        self.inflight_log_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_trailing`.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Set the desired value for `max_catch_up_rounds`.
    pub fn max_catch_up_rounds(mut self, val: u64) -> Self {
        self.max_catch_up_rounds = Some(val);
        self
    }

    /// Set the desired value for `max_applied_batch`.
    pub fn max_applied_batch(mut self, val: u64) -> Self {
        self.max_applied_batch = Some(val);
        self
    }

    /// Enable or disable the pre-vote round.
    pub fn pre_vote(mut self, val: bool) -> Self {
        self.pre_vote = Some(val);
        self
    }

    /// Enable or disable the barrier entry appended on election win.
    pub fn no_op(mut self, val: bool) -> Self {
        self.no_op = Some(val);
        self
    }

    /// Validate the state of this builder, returning a Config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout_min < 3 * heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLessThanHeartBeatInterval);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
            max_payload_entries,
            inflight_log_threshold: self.inflight_log_threshold.unwrap_or(DEFAULT_INFLIGHT_LOG_THRESHOLD),
            snapshot_policy: self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)),
            snapshot_trailing: self.snapshot_trailing.unwrap_or(DEFAULT_SNAPSHOT_TRAILING),
            max_catch_up_rounds: self.max_catch_up_rounds.unwrap_or(DEFAULT_MAX_CATCH_UP_ROUNDS),
            max_applied_batch: self.max_applied_batch.unwrap_or(DEFAULT_MAX_APPLIED_BATCH),
            pre_vote: self.pre_vote.unwrap_or(true),
            no_op: self.no_op.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.max_payload_entries, DEFAULT_MAX_PAYLOAD_ENTRIES);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
        assert!(cfg.pre_vote);
        assert!(cfg.no_op);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0".into()).election_timeout_min(1000).election_timeout_max(700).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn test_election_timeout_must_dominate_heartbeat() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .heartbeat_interval(80)
            .validate();
        assert!(matches!(res, Err(ConfigError::ElectionTimeoutLessThanHeartBeatInterval)));
    }

    #[test]
    fn test_rand_election_timeout_is_within_bounds() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min && t < cfg.election_timeout_max);
        }
    }
}
