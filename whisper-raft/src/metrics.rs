//! Observability of a running Raft node.
//!
//! Every state transition publishes a [`RaftMetrics`] snapshot on a watch
//! channel. [`Wait`] turns that channel into test-friendly "block until the
//! node reaches X" helpers, and the `commit_pos` field doubles as the commit
//! notification: it changes exactly when the node's commit position
//! advances, after parked client requests have been answered.

use std::time::Duration;

use recordlog::LogPos;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::State;
use crate::NodeId;

/// A snapshot of a node's externally relevant state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: i64,
    /// The last known leader, if any.
    pub leader_id: Option<NodeId>,
    pub last_log_pos: LogPos,
    pub last_log_term: i64,
    pub commit_pos: LogPos,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            leader_id: None,
            last_log_pos: LogPos::null(),
            last_log_term: 0,
            commit_pos: LogPos::null(),
        }
    }
}

/// Error returned by [`Wait`] helpers.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Waits for the metrics to satisfy a condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Block until `func` accepts the metrics, or time out.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let delay = tokio::time::timeout(self.timeout, rx.changed());
            match delay.await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => {
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
            }
        }
    }

    /// Wait for the node to enter `want`.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, msg).await
    }

    /// Wait for the node to observe `leader` as the cluster leader.
    pub async fn leader(&self, leader: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.leader_id == Some(leader), msg).await
    }

    /// Wait for the current term to reach `term`.
    pub async fn current_term(&self, term: i64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.current_term >= term, msg).await
    }

    /// Wait for the log tail to reach `pos`.
    pub async fn log_at_least(&self, pos: LogPos, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| !m.last_log_pos.is_null() && m.last_log_pos >= pos, msg).await
    }

    /// Wait for the commit position to reach `pos`.
    pub async fn commit_at_least(
        &self,
        pos: LogPos,
        msg: impl ToString,
    ) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| !m.commit_pos.is_null() && m.commit_pos >= pos, msg).await
    }
}
