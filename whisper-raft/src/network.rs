//! The transport seams.
//!
//! The RPC transport is not this crate's business: peers are reached
//! through [`RaftNetwork`] and client writes through [`ClientNetwork`], and
//! implementations decide how bytes move (HTTP, in-process routing in
//! tests, anything). Timeouts below the per-call deadlines applied here are
//! also the implementation's concern.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::SaveRequest;
use crate::message::SaveResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::NodeId;

/// Server-to-server RPCs, addressed by peer index.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send a RequestVote RPC to the target peer.
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an AppendEntries RPC to the target peer.
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// The client-facing half: a Save RPC addressed by replica name.
#[async_trait]
pub trait ClientNetwork: Send + Sync + 'static {
    async fn save(&self, target: &str, rpc: SaveRequest) -> Result<SaveResponse>;
}
