//! Error types exposed by this crate.

/// Error variants related to the interaction with a Raft node.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// An error with the Raft node's storage layer.
    #[error("raft storage error: {0}")]
    Storage(anyhow::Error),

    /// An error with the network while talking to a peer.
    #[error("raft network error: {0}")]
    Network(anyhow::Error),

    /// The Raft node is shutting down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors surfaced by [`crate::RaftClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No replica accepted the write within the configured retry budget.
    #[error("write not accepted after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// The replica set is empty.
    #[error("no replicas configured")]
    NoReplicas,
}

/// Errors from building a [`crate::Config`] or [`crate::ClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    MissingClusterName,

    #[error("election timeout must be at least 50 ms")]
    ElectionTimeoutTooSmall,

    #[error("max entries size must be greater than zero")]
    MaxEntriesSizeZero,

    #[error("request timeout must be greater than zero")]
    RequestTimeoutZero,
}
