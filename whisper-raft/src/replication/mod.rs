//! Replication streams.
//!
//! The leader runs one task per follower. Each task owns a [`LogReader`]
//! cursor over the leader's log and drives exactly one AppendEntries RPC at
//! a time: batches while the follower lags, heartbeats while it is caught
//! up, and single-entry probes while rewinding after a mismatch.

use std::sync::Arc;

use anyhow::anyhow;
use recordlog::LogPos;
use recordlog::LogReader;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;

use crate::config::Config;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::DataEntry;
use crate::message::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;

/// The handle the leader keeps to one spawned replication task.
pub(crate) struct ReplicationStream {
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

/// An event from the leader to a replication task.
pub(crate) enum RaftEvent {
    /// New entries are in the log up to (but not including) `log_end`.
    Replicate { log_end: LogPos, commit_pos: LogPos },
    /// The commit position moved.
    UpdateCommit { commit_pos: LogPos },
    Terminate,
}

/// An event from a replication task back to the leader.
pub(crate) enum ReplicaEvent {
    /// The follower confirmed its log up to `matched`.
    UpdateMatched { target: NodeId, matched: LogPos },
    /// The follower reported a newer term.
    RevertToFollower { target: NodeId, term: i64 },
    /// Reading our own log failed; the node must stop.
    Shutdown,
}

impl ReplicationStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork>(
        id: NodeId,
        target: NodeId,
        term: i64,
        config: Arc<Config>,
        network: Arc<N>,
        reader: LogReader,
        next_log_pos: LogPos,
        last_log_pos: LogPos,
        last_log_term: i64,
        log_end: LogPos,
        commit_pos: LogPos,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval_ms());
        let core = ReplicationCore {
            id,
            target,
            term,
            config,
            network,
            reader,
            next_log_pos,
            last_log_pos,
            last_log_term,
            matched: LogPos::null(),
            log_end,
            commit_pos,
            probe: false,
            backoff: false,
            shutdown: false,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
        };
        tokio::spawn(core.main());
        ReplicationStream { repl_tx }
    }
}

struct ReplicationCore<N: RaftNetwork> {
    id: NodeId,
    target: NodeId,
    /// The term this stream serves; it never changes, a new term spawns new
    /// streams.
    term: i64,
    config: Arc<Config>,
    network: Arc<N>,

    /// Private cursor over the leader's log.
    reader: LogReader,
    /// Position of the next entry to send.
    next_log_pos: LogPos,
    /// Position/term of the entry just before `next_log_pos`.
    last_log_pos: LogPos,
    last_log_term: i64,
    /// Highest position the follower confirmed.
    matched: LogPos,
    /// The leader's `tell()`: entries below this exist.
    log_end: LogPos,
    commit_pos: LogPos,
    /// After a mismatch, send a single entry to re-establish the matching
    /// point before streaming batches again.
    probe: bool,
    /// After a transport failure, hold further sends until the next
    /// heartbeat tick instead of hammering an unreachable peer.
    backoff: bool,
    shutdown: bool,

    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
    heartbeat: Interval,
    heartbeat_timeout: Duration,
}

impl<N: RaftNetwork> ReplicationCore<N> {
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, target = self.target))]
    async fn main(mut self) {
        // Announce the new leader right away.
        self.send_append_entries().await;

        loop {
            if self.shutdown {
                tracing::debug!(id = self.id, target = self.target, "replication stream stopped");
                return;
            }
            while let Ok(event) = self.repl_rx.try_recv() {
                self.handle_event(event);
            }
            if self.shutdown {
                continue;
            }
            if self.next_log_pos < self.log_end && !self.backoff {
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.backoff = false;
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return,
                },
            }
        }
    }

    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Replicate { log_end, commit_pos } => {
                self.log_end = log_end;
                self.commit_pos = commit_pos;
            }
            RaftEvent::UpdateCommit { commit_pos } => {
                self.commit_pos = commit_pos;
            }
            RaftEvent::Terminate => self.shutdown = true,
        }
    }

    /// Send one AppendEntries RPC and fold its response into the cursor.
    async fn send_append_entries(&mut self) {
        let mut request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            last_log_term: self.last_log_term,
            last_log_pos: self.last_log_pos,
            leader_commit_pos: self.commit_pos,
            entries: Vec::new(),
        };
        let request_prev = self.last_log_pos;

        let max_entries = if self.probe { 1 } else { usize::MAX };
        let mut size = 0u64;
        while self.next_log_pos < self.log_end
            && size < self.config.max_entries_size
            && request.entries.len() < max_entries
        {
            let entry = match self.pull_next() {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::error!(
                        id = self.id,
                        target = self.target,
                        error = %err,
                        "cannot read own log for replication"
                    );
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.shutdown = true;
                    return;
                }
            };
            size += entry.data.len() as u64;
            // The cursor advances as the request fills; a lost RPC is healed
            // by the mismatch path on the next exchange.
            self.last_log_pos = entry.pos;
            self.last_log_term = entry.term;
            request.entries.push(entry);
        }

        tracing::debug!(
            id = self.id,
            target = self.target,
            request = %request.summary(),
            "sending append entries"
        );
        let sent_entries = !request.entries.is_empty();
        let response = match timeout(
            self.heartbeat_timeout,
            self.network.append_entries(self.target, request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::warn!(id = self.id, target = self.target, error = %err, "append entries failed");
                self.backoff = true;
                return;
            }
            Err(_) => {
                tracing::warn!(id = self.id, target = self.target, "append entries timed out");
                self.backoff = true;
                return;
            }
        };

        if response.term > self.term {
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: response.term,
            });
            self.shutdown = true;
            return;
        }
        if response.success {
            self.probe = false;
            if sent_entries {
                self.matched = self.last_log_pos;
                let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatched {
                    target: self.target,
                    matched: self.matched,
                });
            }
            return;
        }
        self.degrade(&response, request_prev);
    }

    /// The follower rejected our matching point; rewind the cursor.
    ///
    /// Fast path: the follower told us its commit position, jump straight
    /// behind it. Slow path: step back one entry (each stored entry names
    /// its predecessor) and probe with a single entry.
    fn degrade(&mut self, response: &AppendEntriesResponse, sent_prev: LogPos) {
        tracing::debug!(
            id = self.id,
            target = self.target,
            response = %response.summary(),
            prev = %sent_prev,
            "follower mismatch, degrading cursor"
        );
        self.next_log_pos = sent_prev;

        if self.next_log_pos.is_null() {
            self.restart_from_scratch();
            return;
        }
        if let Some(commit) = response.commit_pos {
            if commit.is_null() {
                if self.next_log_pos > LogPos::new(0, 0, 0) {
                    self.restart_from_scratch();
                    return;
                }
            } else if commit < self.next_log_pos {
                match self.read_at(commit) {
                    Ok((entry, after)) => {
                        self.last_log_pos = entry.pos;
                        self.last_log_term = entry.term;
                        self.next_log_pos = after;
                        self.probe = false;
                        return;
                    }
                    Err(err) => {
                        tracing::error!(id = self.id, at = %commit, error = %err, "cannot read commit entry");
                        let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                        self.shutdown = true;
                        return;
                    }
                }
            }
        }

        match self.read_at(self.next_log_pos) {
            Ok((entry, _)) => {
                self.last_log_pos = entry.last_log_pos;
                self.last_log_term = entry.last_log_term;
                self.next_log_pos = entry.pos;
                self.probe = true;
            }
            Err(err) => {
                tracing::error!(
                    id = self.id,
                    at = %self.next_log_pos,
                    error = %err,
                    "cannot read entry while degrading"
                );
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.shutdown = true;
            }
        }
    }

    fn restart_from_scratch(&mut self) {
        self.next_log_pos = LogPos::new(0, 0, 0);
        self.last_log_pos = LogPos::null();
        self.last_log_term = 0;
        self.probe = false;
    }

    /// Read the entry at the cursor and advance past it.
    fn pull_next(&mut self) -> anyhow::Result<DataEntry> {
        let (entry, after) = self.read_at(self.next_log_pos)?;
        self.next_log_pos = after;
        Ok(entry)
    }

    fn read_at(&mut self, pos: LogPos) -> anyhow::Result<(DataEntry, LogPos)> {
        self.reader.seek(pos)?;
        let record = self
            .reader
            .get_next_record()
            .ok_or_else(|| anyhow!("no entry at {}", pos))?;
        let entry = DataEntry::decode(&record)?;
        Ok((entry, self.reader.tell()))
    }
}
