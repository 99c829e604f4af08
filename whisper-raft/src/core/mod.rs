//! The core logic of a Raft node.
//!
//! All mutable consensus state is owned by one task. RPC handlers, client
//! writes, timers, and replication feedback are serialized onto it through
//! channels; the state-specific structs below each run the node while it
//! holds that role and return when the role changes.

mod append_entries;
mod client;
mod vote;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use recordlog::LogPos;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::RaftResult;
use crate::message::SaveResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::metrics::RaftMetrics;
use crate::raft::RaftMsg;
use crate::raft::SaveResponseTx;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::RaftLog;
use crate::storage::RaftState;
use crate::NodeId;
use crate::RaftNetwork;

/// The roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Replicating entries from the leader, voting in elections.
    Follower,
    /// Campaigning to become leader.
    Candidate,
    /// Serving client writes and driving replication.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The consensus state machine.
pub(crate) struct RaftCore<N: RaftNetwork> {
    id: NodeId,
    /// Replica names; a node's ID is its index here. Fixed for the life of
    /// the cluster.
    peers: Vec<String>,
    config: Arc<Config>,
    network: Arc<N>,
    log: RaftLog,

    target_state: State,
    current_term: i64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    /// Position/term of the last entry accepted into the log.
    last_log_pos: LogPos,
    last_log_term: i64,
    /// Highest position known to be replicated on a majority.
    commit_pos: LogPos,

    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork> RaftCore<N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        peers: Vec<String>,
        config: Arc<Config>,
        network: Arc<N>,
        log: RaftLog,
        state: RaftState,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id,
            peers,
            config,
            network,
            log,
            target_state: State::Follower,
            current_term: state.current_term,
            voted_for: state.voted_for,
            leader_id: None,
            last_log_pos: state.last_log_pos,
            last_log_term: state.last_log_term,
            commit_pos: state.commit_pos,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::info!(
            id = self.id,
            term = self.current_term,
            last = %self.last_log_pos,
            commit = %self.commit_pos,
            "raft node starting"
        );
        self.update_next_election_timeout();
        self.report_metrics();

        loop {
            match self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "raft node has shut down");
                    return Ok(());
                }
            }
        }
    }

    fn report_metrics(&self) {
        let _ = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            leader_id: self.leader_id,
            last_log_pos: self.last_log_pos,
            last_log_term: self.last_log_term,
            commit_pos: self.commit_pos,
        });
    }

    /// Persist term, vote, tail, and commit. Failures abort the process:
    /// a node that cannot remember its vote must not keep serving.
    fn save_hard_state(&self) {
        self.log.save_state(&RaftState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            last_log_pos: self.last_log_pos,
            last_log_term: self.last_log_term,
            commit_pos: self.commit_pos,
        });
    }

    fn set_target_state(&mut self, state: State) {
        self.target_state = state;
    }

    fn update_next_election_timeout(&mut self) {
        let timeout = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(Instant::now() + timeout);
    }

    fn next_election_deadline(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(instant) => instant,
            None => {
                self.update_next_election_timeout();
                self.next_election_timeout.unwrap()
            }
        }
    }

    /// Step into the follower role, remembering (or forgetting) the leader.
    fn become_follower(&mut self, leader: Option<NodeId>) {
        self.set_target_state(State::Follower);
        self.voted_for = leader;
        self.leader_id = leader;
        self.save_hard_state();
        self.report_metrics();
        tracing::info!(id = self.id, term = self.current_term, ?leader, "became follower");
    }

    /// Revert to follower after an election concluded without a majority.
    /// The vote we cast for ourselves this term stands (a node votes at
    /// most once per term), only the leader is unknown.
    fn abandon_election(&mut self) {
        self.set_target_state(State::Follower);
        self.leader_id = None;
        self.save_hard_state();
        self.report_metrics();
    }

    /// Adopt a higher term observed in a request or response.
    fn update_current_term(&mut self, term: i64, leader: Option<NodeId>) {
        self.current_term = term;
        if !self.target_state.is_follower() {
            self.become_follower(leader);
        } else {
            if leader.is_some() {
                self.leader_id = leader;
            }
            self.save_hard_state();
            self.report_metrics();
        }
    }

    /// The reply for a Save received while not leader: a redirect hint.
    fn handle_save_not_leader(&self) -> SaveResponse {
        tracing::debug!(id = self.id, leader = ?self.leader_id, "save while not leader, redirecting");
        SaveResponse {
            term: self.current_term,
            pos: None,
            leader_name: self
                .leader_id
                .and_then(|leader| self.peers.get(leader as usize).cloned()),
            was_committed: Some(false),
        }
    }

    fn status(&self, nodes: Option<&BTreeMap<NodeId, ReplicationState>>) -> String {
        let mut s = format!(
            "node #{} [state: {:?} / leader: {:?} / voted_for: {:?} / term: {} / last term: {}]\n  \
             commit_pos: {}\n  last_pos:   {}\n  log_pos:    {}\n",
            self.id,
            self.target_state,
            self.leader_id,
            self.voted_for,
            self.current_term,
            self.last_log_term,
            self.commit_pos,
            self.last_log_pos,
            self.log.tell(),
        );
        if let Some(nodes) = nodes {
            for (id, node) in nodes {
                let _ = writeln!(s, "  peer #{} [{}] match: {}", id, self.peers[*id as usize], node.matched);
            }
        }
        s
    }
}

///////////////////////////////////////////////////////////////////////////////

/// A node in the follower role.
struct FollowerState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
}

impl<'a, N: RaftNetwork> FollowerState<'a, N> {
    fn new(core: &'a mut RaftCore<N>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "follower"))]
    async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.next_election_deadline());

            tokio::select! {
                _ = election_timeout => {
                    tracing::info!(id = self.core.id, term = self.core.current_term, "election timeout");
                    self.core.set_target_state(State::Candidate);
                }
                msg = self.core.rx_api.recv() => match msg {
                    Some(RaftMsg::AppendEntries { rpc, tx }) => {
                        let _ = tx.send(Ok(self.core.handle_append_entries_request(rpc)));
                    }
                    Some(RaftMsg::RequestVote { rpc, tx }) => {
                        let _ = tx.send(Ok(self.core.handle_vote_request(rpc)));
                    }
                    Some(RaftMsg::Save { tx, .. }) => {
                        let _ = tx.send(Ok(self.core.handle_save_not_leader()));
                    }
                    Some(RaftMsg::Status { tx }) => {
                        let _ = tx.send(self.core.status(None));
                    }
                    None => self.core.set_target_state(State::Shutdown),
                },
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////

/// A node campaigning for leadership.
struct CandidateState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
    votes_granted: usize,
    votes_needed: usize,
    /// Vote conversations still in flight this term.
    votes_outstanding: usize,
}

impl<'a, N: RaftNetwork> CandidateState<'a, N> {
    fn new(core: &'a mut RaftCore<N>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
            votes_outstanding: 0,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "candidate"))]
    async fn run(mut self) -> RaftResult<()> {
        // Each pass of the outer loop is a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.votes_granted = 1; // Our own.
            self.votes_needed = self.core.peers.len() / 2 + 1;
            self.core.update_next_election_timeout();
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.leader_id = None;
            self.core.save_hard_state();
            self.core.report_metrics();
            tracing::info!(
                id = self.core.id,
                term = self.core.current_term,
                "campaigning for leadership"
            );

            let mut pending_votes = self.spawn_parallel_vote_requests();
            self.votes_outstanding = self.core.peers.len() - 1;
            if self.votes_granted >= self.votes_needed {
                // A cluster of one elects itself.
                self.core.set_target_state(State::Leader);
            }

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout = sleep_until(self.core.next_election_deadline());

                tokio::select! {
                    // This election timed out; start the next term.
                    _ = timeout => break,
                    Some((peer, res)) = pending_votes.recv() => self.handle_vote_response(peer, res),
                    msg = self.core.rx_api.recv() => match msg {
                        Some(RaftMsg::AppendEntries { rpc, tx }) => {
                            let _ = tx.send(Ok(self.core.handle_append_entries_request(rpc)));
                        }
                        Some(RaftMsg::RequestVote { rpc, tx }) => {
                            let _ = tx.send(Ok(self.core.handle_vote_request(rpc)));
                        }
                        Some(RaftMsg::Save { tx, .. }) => {
                            let _ = tx.send(Ok(self.core.handle_save_not_leader()));
                        }
                        Some(RaftMsg::Status { tx }) => {
                            let _ = tx.send(self.core.status(None));
                        }
                        None => self.core.set_target_state(State::Shutdown),
                    },
                    _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }

    fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(NodeId, anyhow::Result<VoteResponse>)> {
        let (tx, rx) = mpsc::channel(self.core.peers.len().max(1));
        for target in 0..self.core.peers.len() as NodeId {
            if target == self.core.id {
                continue;
            }
            let rpc = VoteRequest {
                term: self.core.current_term,
                candidate_id: self.core.id,
                last_log_term: self.core.last_log_term,
                last_log_pos: self.core.last_log_pos,
            };
            let network = self.core.network.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = network.vote(target, rpc).await;
                let _ = tx.send((target, res)).await;
            });
        }
        rx
    }

    fn handle_vote_response(&mut self, peer: NodeId, res: anyhow::Result<VoteResponse>) {
        self.votes_outstanding = self.votes_outstanding.saturating_sub(1);
        match res {
            Ok(resp) => {
                if resp.vote_granted {
                    self.votes_granted += 1;
                    if self.votes_granted >= self.votes_needed {
                        tracing::info!(
                            id = self.core.id,
                            term = self.core.current_term,
                            granted = self.votes_granted,
                            "won the election"
                        );
                        self.core.set_target_state(State::Leader);
                        return;
                    }
                } else if resp.term > self.core.current_term {
                    tracing::info!(
                        id = self.core.id,
                        peer,
                        term = resp.term,
                        "vote response carries a newer term, stepping down"
                    );
                    self.core.update_current_term(resp.term, None);
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(id = self.core.id, peer, error = %err, "vote conversation failed");
            }
        }
        if self.votes_outstanding == 0
            && self.core.target_state.is_candidate()
            && self.votes_granted < self.votes_needed
        {
            // Every conversation finished and the majority never came.
            tracing::info!(
                id = self.core.id,
                term = self.core.current_term,
                granted = self.votes_granted,
                "election concluded without a majority"
            );
            self.core.abandon_election();
        }
    }
}

///////////////////////////////////////////////////////////////////////////////

/// The replication bookkeeping a leader keeps per peer.
pub(crate) struct ReplicationState {
    /// Highest position the peer confirmed replicated.
    pub matched: LogPos,
    pub replstream: ReplicationStream,
}

/// A node in the leader role.
struct LeaderState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
    nodes: BTreeMap<NodeId, ReplicationState>,
    /// Client requests parked until their position commits, in order.
    waiters: BTreeMap<LogPos, (SaveResponse, SaveResponseTx)>,
    replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
    replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    fn new(core: &'a mut RaftCore<N>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            waiters: BTreeMap::new(),
            replication_tx,
            replication_rx,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, raft_state = "leader"))]
    async fn run(mut self) -> RaftResult<()> {
        self.core.voted_for = Some(self.core.id);
        self.core.leader_id = Some(self.core.id);
        self.core.next_election_timeout = None;

        // Every peer cursor starts at our own tail.
        let next_log_pos = if self.core.last_log_pos.is_null() {
            LogPos::new(0, 0, 0)
        } else {
            match self.core.log.read_entry_at(self.core.last_log_pos) {
                Ok((_, after)) => after,
                Err(err) => {
                    tracing::error!(
                        id = self.core.id,
                        error = %err,
                        "cannot read own log tail, shutting down"
                    );
                    self.core.set_target_state(State::Shutdown);
                    return Ok(());
                }
            }
        };
        self.core.save_hard_state();
        self.core.report_metrics();
        tracing::info!(id = self.core.id, term = self.core.current_term, "became leader");

        for target in 0..self.core.peers.len() as NodeId {
            if target == self.core.id {
                continue;
            }
            let replstream = ReplicationStream::new(
                self.core.id,
                target,
                self.core.current_term,
                self.core.config.clone(),
                self.core.network.clone(),
                self.core.log.new_reader(),
                next_log_pos,
                self.core.last_log_pos,
                self.core.last_log_term,
                self.core.log.tell(),
                self.core.commit_pos,
                self.replication_tx.clone(),
            );
            self.nodes.insert(
                target,
                ReplicationState {
                    matched: LogPos::null(),
                    replstream,
                },
            );
        }

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send(RaftEvent::Terminate);
                }
                self.fail_waiters();
                return Ok(());
            }

            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some(RaftMsg::AppendEntries { rpc, tx }) => {
                        let _ = tx.send(Ok(self.core.handle_append_entries_request(rpc)));
                    }
                    Some(RaftMsg::RequestVote { rpc, tx }) => {
                        let _ = tx.send(Ok(self.core.handle_vote_request(rpc)));
                    }
                    Some(RaftMsg::Save { rpc, tx }) => self.handle_save(rpc, tx),
                    Some(RaftMsg::Status { tx }) => {
                        let _ = tx.send(self.core.status(Some(&self.nodes)));
                    }
                    None => self.core.set_target_state(State::Shutdown),
                },
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event),
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    fn handle_replica_event(&mut self, event: ReplicaEvent) {
        match event {
            ReplicaEvent::UpdateMatched { target, matched } => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.matched = matched;
                }
                self.maybe_advance_commit();
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(
                        id = self.core.id,
                        target,
                        term,
                        "replication discovered a newer term, stepping down"
                    );
                    self.core.update_current_term(term, None);
                }
            }
            ReplicaEvent::Shutdown => {
                tracing::error!(id = self.core.id, "replication hit a fatal storage error");
                self.core.set_target_state(State::Shutdown);
            }
        }
    }
}
