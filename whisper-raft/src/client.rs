//! The retrying client.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::message::SaveRequest;
use crate::message::SaveResponse;
use crate::network::ClientNetwork;

/// Submits writes to a replicated log, finding the leader as it goes.
///
/// The client remembers the last leader hint (`leader_name` from a
/// redirecting replica) and otherwise walks the replica set round-robin.
/// Transport failures clear the hint, pause for the reconnect interval, and
/// retry; the total number of attempts is bounded by the configured retry
/// budget.
pub struct RaftClient<T: ClientNetwork> {
    config: ClientConfig,
    replicas: Vec<String>,
    network: Arc<T>,
    state: Mutex<ClientState>,
}

struct ClientState {
    /// Confirmed leader name, sticky until contradicted.
    leader_name: Option<String>,
    /// The next replica to try when no leader is known.
    next_index: usize,
}

impl<T: ClientNetwork> RaftClient<T> {
    pub fn new(config: ClientConfig, replicas: Vec<String>, network: Arc<T>) -> Self {
        Self {
            config,
            replicas,
            network,
            state: Mutex::new(ClientState {
                leader_name: None,
                next_index: 0,
            }),
        }
    }

    /// Send data without waiting for commit: returns as soon as a leader has
    /// accepted (appended) the write.
    pub async fn send_data(&self, data: Vec<u8>) -> Result<SaveResponse, ClientError> {
        self.save(data, false).await
    }

    /// Send data and wait until it is committed. A successful return is the
    /// commit acknowledgment.
    pub async fn send_data_committed(&self, data: Vec<u8>) -> Result<SaveResponse, ClientError> {
        self.save(data, true).await
    }

    async fn save(&self, data: Vec<u8>, wait_to_commit: bool) -> Result<SaveResponse, ClientError> {
        if self.replicas.is_empty() {
            return Err(ClientError::NoReplicas);
        }
        let max_attempts = (self.config.num_retries + 1) * self.replicas.len();
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        let reopen_interval = Duration::from_millis(self.config.reopen_connection_interval_ms);

        let mut attempts = 0;
        loop {
            let target = self.pick_target();
            let rpc = SaveRequest {
                data: data.clone(),
                wait_to_commit,
            };
            attempts += 1;

            match timeout(request_timeout, self.network.save(&target, rpc)).await {
                Ok(Ok(response)) => {
                    let accepted = response.pos.is_some()
                        && (!wait_to_commit || response.was_committed == Some(true));
                    if accepted {
                        return Ok(response);
                    }
                    // Not written; the replica may know who the leader is.
                    self.set_leader_hint(response.leader_name.clone());
                    tracing::info!(target = %target, "write not accepted, may retry");
                }
                Ok(Err(err)) => {
                    tracing::warn!(target = %target, error = %err, "save failed");
                    self.set_leader_hint(None);
                    sleep(reopen_interval).await;
                }
                Err(_) => {
                    tracing::warn!(target = %target, "save timed out");
                    self.set_leader_hint(None);
                    sleep(reopen_interval).await;
                }
            }

            if attempts >= max_attempts {
                return Err(ClientError::RetriesExhausted { attempts });
            }
        }
    }

    fn pick_target(&self) -> String {
        let mut state = self.state.lock().unwrap();
        if let Some(leader) = &state.leader_name {
            return leader.clone();
        }
        let target = self.replicas[state.next_index % self.replicas.len()].clone();
        state.next_index = (state.next_index + 1) % self.replicas.len();
        target
    }

    fn set_leader_hint(&self, leader: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.leader_name = leader.filter(|name| self.replicas.contains(name));
    }
}
