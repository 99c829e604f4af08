//! Public Raft interface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use recordlog::LogPos;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::SaveRequest;
use crate::message::SaveResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::storage::RaftLog;
use crate::NodeId;

struct RaftInner<N: RaftNetwork> {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
}

/// A running Raft node.
///
/// Spawns the consensus task on construction and is the handle through
/// which RPCs from peers and client writes reach it. Clones are cheap and
/// share the node.
pub struct Raft<N: RaftNetwork> {
    inner: Arc<RaftInner<N>>,
}

impl<N: RaftNetwork> Raft<N> {
    /// Create and spawn a Raft node.
    ///
    /// `node_id` is this node's index into `peers`, the fixed list of
    /// replica names (the peer set cannot change later). `log` must wrap the
    /// node's own log directory; the persistent Raft state is loaded from it
    /// before the node starts serving.
    ///
    /// Fails when the state file is missing while the log already holds
    /// data: serving with a forgotten term or vote could elect two leaders
    /// in one term, so the node refuses to come up.
    pub fn new(
        node_id: NodeId,
        peers: Vec<String>,
        config: Arc<Config>,
        network: Arc<N>,
        log: RaftLog,
    ) -> RaftResult<Self> {
        if node_id < 0 || (node_id as usize) >= peers.len() {
            return Err(RaftError::Storage(anyhow!(
                "node id {} outside peer set of {}",
                node_id,
                peers.len()
            )));
        }
        let state = log.load_state().map_err(RaftError::Storage)?;
        if state.is_none() && log.tell() != LogPos::new(0, 0, 0) {
            return Err(RaftError::Storage(anyhow!(
                "raft state file missing but log is at {}; refusing to serve",
                log.tell()
            )));
        }

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(node_id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(
            node_id,
            peers,
            config,
            network,
            log,
            state.unwrap_or_default(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Submit a RequestVote RPC from a candidate peer.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::RequestVote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an AppendEntries RPC from the cluster leader (also the
    /// heartbeat path).
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(
        &self,
        rpc: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a client write.
    ///
    /// On a follower the reply only carries a leader hint. On the leader
    /// with `wait_to_commit` set, the future resolves once the entry is
    /// replicated to a majority (or the leader steps down first, reported
    /// as `was_committed == Some(false)`).
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn save(&self, rpc: SaveRequest) -> RaftResult<SaveResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Save { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// A handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for awaiting metrics conditions, mostly for tests.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// A debug rendering of the node and, on a leader, its peer cursors.
    pub async fn status_string(&self) -> RaftResult<String> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Status { tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Shut the node down and await its task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork> Clone for Raft<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type SaveResponseTx = oneshot::Sender<RaftResult<SaveResponse>>;

/// A message from the API surface to the core task.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    Save {
        rpc: SaveRequest,
        tx: SaveResponseTx,
    },
    Status {
        tx: oneshot::Sender<String>,
    },
}
