//! Runtime configuration.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 2000;

/// Default maximum byte size of one AppendEntries batch.
pub const DEFAULT_MAX_ENTRIES_SIZE: u64 = 1 << 20;

/// The runtime configuration of a Raft node.
///
/// Built via [`Config::build`]:
///
/// ```
/// use whisper_raft::Config;
/// let config = Config::build("my-cluster".into())
///     .election_timeout_ms(500)
///     .validate()
///     .unwrap();
/// assert_eq!(config.heartbeat_interval_ms(), 100);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// The cluster's name, carried in tracing output only.
    pub cluster_name: String,
    /// How long a follower waits without hearing from a leader before it
    /// becomes a candidate. The actual deadline adds up to 90% jitter.
    pub election_timeout_ms: u64,
    /// Byte budget of one AppendEntries batch per follower.
    pub max_entries_size: u64,
}

impl Config {
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_ms: None,
            max_entries_size: None,
        }
    }

    /// Leaders heartbeat every 20% of the election timeout.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        (self.election_timeout_ms / 5).max(1)
    }

    /// A fresh randomized election timeout: the base plus a jitter of
    /// 0–90% in 10% steps, so simultaneous timeouts fan out.
    pub fn new_rand_election_timeout(&self) -> u64 {
        let step = thread_rng().gen_range(0..10u64);
        self.election_timeout_ms + self.election_timeout_ms * step / 10
    }
}

pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_ms: Option<u64>,
    max_entries_size: Option<u64>,
}

impl ConfigBuilder {
    pub fn election_timeout_ms(mut self, ms: u64) -> Self {
        self.election_timeout_ms = Some(ms);
        self
    }

    pub fn max_entries_size(mut self, bytes: u64) -> Self {
        self.max_entries_size = Some(bytes);
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            cluster_name: self.cluster_name,
            election_timeout_ms: self.election_timeout_ms.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MS),
            max_entries_size: self.max_entries_size.unwrap_or(DEFAULT_MAX_ENTRIES_SIZE),
        };
        if config.cluster_name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if config.election_timeout_ms < 50 {
            return Err(ConfigError::ElectionTimeoutTooSmall);
        }
        if config.max_entries_size == 0 {
            return Err(ConfigError::MaxEntriesSizeZero);
        }
        Ok(config)
    }
}

/// Configuration of the retrying [`crate::RaftClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Full passes over the replica set before giving up, beyond the first.
    pub num_retries: usize,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Pause before retrying after a transport failure, in milliseconds.
    pub reopen_connection_interval_ms: u64,
}

impl ClientConfig {
    pub fn build() -> ClientConfigBuilder {
        ClientConfigBuilder {
            num_retries: None,
            request_timeout_ms: None,
            reopen_connection_interval_ms: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::build().validate().unwrap()
    }
}

pub struct ClientConfigBuilder {
    num_retries: Option<usize>,
    request_timeout_ms: Option<u64>,
    reopen_connection_interval_ms: Option<u64>,
}

impl ClientConfigBuilder {
    pub fn num_retries(mut self, n: usize) -> Self {
        self.num_retries = Some(n);
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    pub fn reopen_connection_interval_ms(mut self, ms: u64) -> Self {
        self.reopen_connection_interval_ms = Some(ms);
        self
    }

    pub fn validate(self) -> Result<ClientConfig, ConfigError> {
        let config = ClientConfig {
            num_retries: self.num_retries.unwrap_or(2),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(40_000),
            reopen_connection_interval_ms: self.reopen_connection_interval_ms.unwrap_or(500),
        };
        if config.request_timeout_ms == 0 {
            return Err(ConfigError::RequestTimeoutZero);
        }
        Ok(config)
    }
}
