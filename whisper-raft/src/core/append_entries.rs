//! AppendEntries handling on the receiving (follower) side.

use recordlog::LogPos;

use crate::core::RaftCore;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::DataEntry;
use crate::message::MessageSummary;
use crate::RaftNetwork;

impl<N: RaftNetwork> RaftCore<N> {
    /// Process an AppendEntries RPC: heartbeat check or truncate-then-append,
    /// then commit advancement.
    pub(crate) fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if req.term < self.current_term {
            tracing::debug!(
                id = self.id,
                request = %req.summary(),
                term = self.current_term,
                "stale term, rejecting append"
            );
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                current_pos: None,
                commit_pos: None,
            };
        }

        // A valid leader is talking to us; hold off elections.
        self.update_next_election_timeout();
        if req.term == self.current_term {
            if self.target_state.is_candidate() {
                self.become_follower(Some(req.leader_id));
            } else if self.leader_id != Some(req.leader_id) {
                self.leader_id = Some(req.leader_id);
                self.save_hard_state();
                self.report_metrics();
            }
        } else {
            self.update_current_term(req.term, Some(req.leader_id));
        }

        let mut success = false;
        let mut need_save = false;
        if req.entries.is_empty() {
            // Heartbeat: confirm only when our tail matches the leader's view.
            success =
                self.last_log_pos == req.last_log_pos && self.last_log_term == req.last_log_term;
        } else if self.maybe_truncate_log_after(req.last_log_term, req.last_log_pos) {
            if self.append_request_entries(&req.entries) {
                success = true;
                need_save = true;
            }
        } else {
            tracing::info!(
                id = self.id,
                request = %req.summary(),
                last = %self.last_log_pos,
                last_term = self.last_log_term,
                "could not reconcile log for append request"
            );
        }

        let mut commit_updated = false;
        if success {
            let new_commit = req.leader_commit_pos.min(self.last_log_pos);
            if new_commit > self.commit_pos {
                self.commit_pos = new_commit;
                commit_updated = true;
                need_save = true;
            }
            if need_save {
                self.save_hard_state();
            }
        }
        if need_save || commit_updated {
            self.report_metrics();
        }

        AppendEntriesResponse {
            term: self.current_term,
            success,
            current_pos: Some(self.log.tell()),
            commit_pos: Some(self.commit_pos),
        }
    }

    /// Establish the matching point for an incoming batch, discarding our
    /// uncommitted suffix past it if there is one.
    ///
    /// `prev_pos`/`prev_term` name the entry immediately before the batch.
    /// Succeeds when that entry exists in our log with the same term (or the
    /// batch starts at the very beginning); fails otherwise so the leader
    /// rewinds its cursor. Committed entries are never discarded.
    fn maybe_truncate_log_after(&mut self, prev_term: i64, prev_pos: LogPos) -> bool {
        let writer_pos = self.log.tell();
        let zero = LogPos::new(0, 0, 0);
        let is_first = writer_pos == prev_pos && writer_pos == zero;
        if writer_pos <= prev_pos && !is_first {
            tracing::info!(
                id = self.id,
                writer = %writer_pos,
                prev = %prev_pos,
                "we are before the leader's previous position"
            );
            return false;
        }

        let matching_point = if prev_pos.is_null() || is_first {
            zero
        } else {
            match self.log.read_entry_at(prev_pos) {
                Ok((entry, after)) => {
                    if entry.term != prev_term {
                        tracing::info!(
                            id = self.id,
                            ours = entry.term,
                            leaders = prev_term,
                            "previous terms do not match"
                        );
                        return false;
                    }
                    after
                }
                Err(err) => {
                    tracing::info!(id = self.id, prev = %prev_pos, error = %err, "cannot read previous entry");
                    return false;
                }
            }
        };

        if writer_pos > matching_point {
            // Truncation keeps entries up to and including `prev_pos`; every
            // committed entry must be among them.
            if prev_pos < self.commit_pos {
                tracing::error!(
                    id = self.id,
                    prev = %prev_pos,
                    commit = %self.commit_pos,
                    "refusing to truncate committed entries"
                );
                return false;
            }
            self.last_log_pos = prev_pos;
            self.save_hard_state();
            if let Err(err) = self.log.truncate_suffix(matching_point) {
                tracing::error!(id = self.id, at = %matching_point, error = %err, "truncation failed");
                return false;
            }
        } else {
            self.last_log_pos = prev_pos;
        }
        true
    }

    /// Append the batch in order, flushing each entry. On any failure the
    /// partial batch is rolled back and the request fails as a whole.
    fn append_request_entries(&mut self, entries: &[DataEntry]) -> bool {
        let start_pos = self.log.tell();
        let mut last_pos = self.last_log_pos;
        let mut last_term = self.last_log_term;
        for entry in entries {
            let tell = self.log.tell();
            if entry.pos != tell {
                tracing::error!(
                    id = self.id,
                    entry = %entry.pos,
                    log = %tell,
                    "entry does not land at our log position"
                );
                let _ = self.log.truncate_suffix(start_pos);
                return false;
            }
            if let Err(err) = self.log.append(entry).and_then(|_| self.log.flush(true)) {
                tracing::error!(id = self.id, at = %tell, error = %err, "error writing log");
                let _ = self.log.truncate_suffix(start_pos);
                return false;
            }
            last_pos = entry.pos;
            last_term = entry.term;
        }
        self.last_log_pos = last_pos;
        self.last_log_term = last_term;
        true
    }
}
