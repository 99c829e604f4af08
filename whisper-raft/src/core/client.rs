//! Client write handling and commit advancement on the leader.

use recordlog::LogPos;

use crate::core::LeaderState;
use crate::message::DataEntry;
use crate::message::SaveRequest;
use crate::message::SaveResponse;
use crate::raft::SaveResponseTx;
use crate::replication::RaftEvent;
use crate::RaftNetwork;

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    /// Accept a client write: append it at our tail, flush, then hand it to
    /// the per-peer replication tasks. With `wait_to_commit` the reply is
    /// parked until the entry's position commits.
    pub(super) fn handle_save(&mut self, rpc: SaveRequest, tx: SaveResponseTx) {
        let pos = self.core.log.tell();
        let entry = DataEntry {
            pos,
            last_log_pos: self.core.last_log_pos,
            term: self.core.current_term,
            last_log_term: self.core.last_log_term,
            data: rpc.data,
        };
        let mut response = SaveResponse {
            term: self.core.current_term,
            pos: None,
            leader_name: None,
            was_committed: None,
        };

        let appended = self
            .core
            .log
            .append(&entry)
            .and_then(|_| self.core.log.flush(true));
        if let Err(err) = appended {
            tracing::error!(id = self.core.id, at = %pos, error = %err, "error writing log");
            response.was_committed = Some(false);
            let _ = tx.send(Ok(response));
            return;
        }

        self.core.last_log_pos = pos;
        self.core.last_log_term = self.core.current_term;
        self.core.save_hard_state();
        self.core.report_metrics();
        response.pos = Some(pos);

        // Caught-up peers pick this up immediately; lagging ones are already
        // being driven by their replication task.
        let log_end = self.core.log.tell();
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::Replicate {
                log_end,
                commit_pos: self.core.commit_pos,
            });
        }

        if rpc.wait_to_commit {
            self.waiters.insert(pos, (response, tx));
            // A cluster of one commits on the spot.
            self.maybe_advance_commit();
        } else {
            self.maybe_advance_commit();
            let _ = tx.send(Ok(response));
        }
    }

    /// The commit rule: sort every peer's match position (our own tail
    /// standing in for ourselves) and take the lower median: the highest
    /// position a majority has replicated. Advancing it answers parked
    /// clients in position order.
    pub(super) fn maybe_advance_commit(&mut self) {
        let mut positions: Vec<LogPos> = self.nodes.values().map(|n| n.matched).collect();
        positions.push(self.core.last_log_pos);
        positions.sort_unstable();
        let can_commit = positions[(positions.len() - 1) / 2];
        if can_commit <= self.core.commit_pos {
            return;
        }
        tracing::debug!(
            id = self.core.id,
            from = %self.core.commit_pos,
            to = %can_commit,
            "advancing commit position"
        );
        self.core.commit_pos = can_commit;
        self.core.save_hard_state();
        self.advance_waiters();
        // The metrics watch doubles as the commit notification; it fires
        // after the waiter map has been processed.
        self.core.report_metrics();
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::UpdateCommit {
                commit_pos: self.core.commit_pos,
            });
        }
    }

    /// Answer every waiter at or below the commit position, in order.
    fn advance_waiters(&mut self) {
        let ready: Vec<LogPos> = self
            .waiters
            .range(..=self.core.commit_pos)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in ready {
            if let Some((mut response, tx)) = self.waiters.remove(&pos) {
                response.was_committed = Some(true);
                let _ = tx.send(Ok(response));
            }
        }
    }

    /// A leader stepping down fails its parked clients; they retry against
    /// the new leader.
    pub(super) fn fail_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        tracing::info!(
            id = self.core.id,
            waiters = self.waiters.len(),
            "failing parked client requests"
        );
        for (_, (mut response, tx)) in std::mem::take(&mut self.waiters) {
            response.was_committed = Some(false);
            let _ = tx.send(Ok(response));
        }
    }
}
