//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be application specific. So, the
/// intention here is that applications which are using this crate will provide an
/// implementation of this trait which will be used by Raft as needed for deliving RPCs to
/// cluster peers.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>)
        -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    ///
    /// The receiver acknowledges the installation with an AppendEntries result whose
    /// `last_log_index` names the snapshot's last covered index.
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest)
        -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a TimeoutNow RPC to the target Raft node, as part of a leadership transfer.
    ///
    /// This is fire-and-forget: the outcome of the transfer is observed through the
    /// transferee's election.
    async fn send_timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> Result<()>;
}
