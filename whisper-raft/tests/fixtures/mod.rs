//! Fixtures for testing the Raft layer.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use recordlog::LogReader;
use recordlog::LogWriter;
use tempfile::TempDir;
use tokio::sync::RwLock;
use whisper_raft::message::AppendEntriesRequest;
use whisper_raft::message::AppendEntriesResponse;
use whisper_raft::message::VoteRequest;
use whisper_raft::message::VoteResponse;
use whisper_raft::ClientNetwork;
use whisper_raft::Config;
use whisper_raft::DataEntry;
use whisper_raft::NodeId;
use whisper_raft::Raft;
use whisper_raft::RaftLog;
use whisper_raft::RaftMetrics;
use whisper_raft::RaftNetwork;
use whisper_raft::SaveRequest;
use whisper_raft::SaveResponse;
use whisper_raft::State;
use whisper_raft::Wait;

pub const BLOCK_SIZE: usize = 256;
pub const BLOCKS_PER_FILE: usize = 64;

/// Initialize the tracing system for a test binary.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

struct TestNode {
    raft: Raft<RaftRouter>,
    dir: Arc<TempDir>,
}

/// An in-process network: routes RPCs between registered nodes, with
/// optional isolation to emulate partitions and crashes.
pub struct RaftRouter {
    /// Replica names; a node's ID is its index here.
    peers: Vec<String>,
    routing_table: RwLock<BTreeMap<NodeId, TestNode>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new(num_nodes: usize) -> Arc<Self> {
        let peers = (0..num_nodes).map(|i| format!("n{}", i)).collect();
        Arc::new(Self {
            peers,
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
        })
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.clone()
    }

    /// Create and register a node with its own fresh log directory.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, config: Arc<Config>) -> Result<()> {
        let dir = Arc::new(tempfile::tempdir()?);
        self.new_raft_node_with_dir(id, dir, config).await
    }

    /// Create and register a node over an existing log directory (restart).
    pub async fn new_raft_node_with_dir(
        self: &Arc<Self>,
        id: NodeId,
        dir: Arc<TempDir>,
        config: Arc<Config>,
    ) -> Result<()> {
        let writer = LogWriter::new(
            dir.path(),
            &self.peers[id as usize],
            BLOCK_SIZE,
            BLOCKS_PER_FILE,
            false,
            false,
        );
        let log = RaftLog::open(writer)?;
        let raft = Raft::new(id, self.peers(), config, self.clone(), log)
            .map_err(|err| anyhow!("spawning node {}: {}", id, err))?;
        let mut rt = self.routing_table.write().await;
        rt.insert(id, TestNode { raft, dir });
        Ok(())
    }

    /// Shut a node down and unregister it, returning its log directory so a
    /// test can restart it later.
    pub async fn shutdown_node(&self, id: NodeId) -> Result<Arc<TempDir>> {
        let node = {
            let mut rt = self.routing_table.write().await;
            rt.remove(&id).with_context(|| format!("node {} not registered", id))?
        };
        node.raft.shutdown().await?;
        Ok(node.dir)
    }

    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    pub async fn get_raft(&self, id: NodeId) -> Result<Raft<RaftRouter>> {
        let rt = self.routing_table.read().await;
        Ok(rt
            .get(&id)
            .with_context(|| format!("node {} not registered", id))?
            .raft
            .clone())
    }

    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> Result<Wait> {
        Ok(self.get_raft(id).await?.wait(timeout))
    }

    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    /// The current leader, if any non-isolated node claims the role.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics()
            .await
            .into_iter()
            .find(|m| m.state == State::Leader && !isolated.contains(&m.id))
            .map(|m| m.id)
    }

    /// Poll until some node is leader and every non-isolated node agrees on
    /// it and on the term.
    pub async fn wait_for_stable_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let isolated = self.isolated_nodes.read().await.clone();
            let metrics: Vec<RaftMetrics> = self
                .latest_metrics()
                .await
                .into_iter()
                .filter(|m| !isolated.contains(&m.id))
                .collect();
            let leaders: Vec<&RaftMetrics> =
                metrics.iter().filter(|m| m.state == State::Leader).collect();
            if leaders.len() == 1 {
                let leader = leaders[0];
                let agreed = metrics.iter().all(|m| {
                    m.leader_id == Some(leader.id) && m.current_term == leader.current_term
                });
                if agreed {
                    return Ok(leader.id);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no stable leader within {:?}: {:?}", timeout, metrics));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a Save straight at one node, bypassing client retry logic.
    pub async fn save_direct(&self, target: NodeId, rpc: SaveRequest) -> Result<SaveResponse> {
        let raft = self.get_raft(target).await?;
        Ok(raft.save(rpc).await?)
    }

    /// Decode every entry currently readable from a node's log.
    pub async fn read_entries(&self, id: NodeId) -> Result<Vec<DataEntry>> {
        let dir = {
            let rt = self.routing_table.read().await;
            rt.get(&id)
                .with_context(|| format!("node {} not registered", id))?
                .dir
                .clone()
        };
        let mut reader = LogReader::new(
            dir.path(),
            &self.peers[id as usize],
            BLOCK_SIZE,
            BLOCKS_PER_FILE,
        );
        let mut entries = Vec::new();
        while let Some(record) = reader.get_next_record() {
            entries.push(DataEntry::decode(&record)?);
        }
        Ok(entries)
    }

    async fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated_nodes.read().await.contains(&id)
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        if self.is_isolated(target).await || self.is_isolated(rpc.candidate_id).await {
            return Err(anyhow!("node is isolated"));
        }
        let raft = self.get_raft(target).await?;
        Ok(raft.vote(rpc).await?)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.is_isolated(target).await || self.is_isolated(rpc.leader_id).await {
            return Err(anyhow!("node is isolated"));
        }
        let raft = self.get_raft(target).await?;
        Ok(raft.append_entries(rpc).await?)
    }
}

#[async_trait]
impl ClientNetwork for RaftRouter {
    async fn save(&self, target: &str, rpc: SaveRequest) -> Result<SaveResponse> {
        let id = self
            .peers
            .iter()
            .position(|name| name == target)
            .map(|i| i as NodeId)
            .with_context(|| format!("unknown replica {}", target))?;
        if self.is_isolated(id).await {
            return Err(anyhow!("node is isolated"));
        }
        let raft = self.get_raft(id).await?;
        Ok(raft.save(rpc).await?)
    }
}

/// A config with short timeouts for tests.
pub fn test_config(election_timeout_ms: u64) -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout_ms(election_timeout_ms)
            .validate()
            .expect("failed to build Raft config"),
    )
}
