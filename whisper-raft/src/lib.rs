//! A Raft-replicated log.
//!
//! Peers replicate opaque byte records through a leader into
//! [`recordlog`]-backed operation logs, addressed by
//! [`LogPos`](recordlog::LogPos) coordinates. The crate provides:
//!
//! - [`Raft`]: a running node. Spawn one per replica and wire its RPCs
//!   (`Vote`, `Append`, `Save`) to your transport through [`RaftNetwork`];
//! - [`RaftClient`]: a retrying client that locates the leader and submits
//!   writes, optionally blocking until they commit;
//! - [`RaftLog`](storage::RaftLog): the node's durable state, the record
//!   log plus the atomically-rewritten Raft state file.
//!
//! Membership is fixed at startup; there is no snapshotting or log
//! compaction.

mod client;
mod config;
mod raft;

pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod storage;

pub(crate) mod core;
pub(crate) mod replication;

pub use client::RaftClient;
pub use config::ClientConfig;
pub use config::Config;
pub use crate::core::State;
pub use error::ClientError;
pub use error::ConfigError;
pub use error::RaftError;
pub use error::RaftResult;
pub use message::DataEntry;
pub use message::SaveRequest;
pub use message::SaveResponse;
pub use metrics::RaftMetrics;
pub use metrics::Wait;
pub use network::ClientNetwork;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use recordlog::LogPos;
pub use storage::RaftLog;

/// A node's identity: its index into the fixed replica list.
pub type NodeId = i32;
