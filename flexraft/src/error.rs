//! Error types exposed by this crate.

use std::fmt;

use crate::membership::ServerRole;
use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// The node is busy persisting metadata or installing a snapshot and cannot serve the
    /// request right now.
    #[error("the node is busy and cannot serve the request")]
    Busy,
    /// A log truncation was refused because entries in the range are referenced by in-flight I/O.
    #[error("log entries are referenced by in-flight I/O")]
    LogBusy,
    /// A safety-critical invariant was violated and the node is shutting down.
    #[error("a safety-critical invariant was violated")]
    Shutdown,
    /// An internal message was discarded without being processed.
    #[error("the message was discarded")]
    Discard,
    /// The Raft node is shutting down.
    #[error("the Raft node is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// An error related to a client write request.
#[derive(thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
}

impl<D: AppData> fmt::Debug for ClientWriteError<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientWriteError::RaftError(err) => f.debug_tuple("RaftError").field(err).finish(),
            ClientWriteError::ForwardToLeader(_, node) => f.debug_tuple("ForwardToLeader").field(node).finish(),
        }
    }
}

/// An error related to a barrier request.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node is not the cluster leader.
    #[error("the barrier request must be submitted to the cluster leader")]
    ForwardToLeader(Option<NodeId>),
}

/// Error variants related to configuration changes and other admin commands.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node is not the cluster leader and the request must be submitted to the leader.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// No server with the given ID exists in the configuration.
    #[error("no server has ID {0}")]
    NotFound(NodeId),
    /// The given server ID is not valid for the operation.
    #[error("server ID {0} is not valid for this operation")]
    BadId(NodeId),
    /// A server with the given ID is already present in the configuration.
    #[error("a server with ID {0} already exists in the configuration")]
    DuplicateId(NodeId),
    /// The given role is not valid for the operation, or the server already has it.
    #[error("server {id} cannot be assigned role {role}")]
    BadRole { id: NodeId, role: ServerRole },
    /// A configuration change is already in progress.
    #[error("a configuration change is already in progress")]
    ChangeInProgress,
    /// The promoted server failed to catch up with the leader's log within the allowed
    /// number of rounds.
    #[error("the server did not catch up within the allowed number of rounds")]
    CatchUpFailed,
    /// The requested change would leave the cluster unable to form a quorum.
    #[error("the requested change would produce an inoperable configuration")]
    InoperableConfig,
}

/// Error variants related to leadership transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node is not the cluster leader.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// No suitable transfer target was found.
    #[error("there is no other up-to-date voting server")]
    NoTarget,
    /// The given ID does not name a voting server of this cluster.
    #[error("server {0} is not a voter of this cluster")]
    BadId(NodeId),
    /// The transferee did not take over before the transfer deadline.
    #[error("the leadership transfer timed out")]
    Timeout,
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}

/// Error variants related to decoding a wire-format configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The encoded payload does not follow the versioned configuration format.
    #[error("malformed configuration payload: {0}")]
    Malformed(&'static str),
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Error variants related to configuration validation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid. Max must be greater than min.
    #[error("given values for election timeout min & max are invalid, max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The election timeout must be significantly larger than the heartbeat interval.
    #[error("the election timeout must be at least three times the heartbeat interval")]
    ElectionTimeoutLessThanHeartBeatInterval,
}
