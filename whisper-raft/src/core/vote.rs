//! Vote request handling.

use crate::core::RaftCore;
use crate::core::State;
use crate::message::MessageSummary;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::RaftNetwork;

impl<N: RaftNetwork> RaftCore<N> {
    /// Decide a RequestVote RPC.
    ///
    /// The grant rule, in order:
    /// 1. an unknown candidate index never gets a vote;
    /// 2. a strictly newer term whose log covers our commit position is
    ///    granted, even over an existing `voted_for` from an older term;
    /// 3. otherwise the request must not be stale, we must not have voted
    ///    this term, and the candidate's log must reach our own tail.
    ///
    /// The vote (with the adopted term) is persisted before the reply is
    /// sent, so a restart cannot double-vote in one term.
    pub(crate) fn handle_vote_request(&mut self, req: VoteRequest) -> VoteResponse {
        let known_peer = req.candidate_id >= 0 && (req.candidate_id as usize) < self.peers.len();

        let vote_granted = if !known_peer {
            false
        } else if self.current_term < req.term && req.last_log_pos >= self.commit_pos {
            true
        } else if req.term < self.current_term
            || self.voted_for.is_some()
            || req.last_log_pos < self.last_log_pos
        {
            false
        } else {
            true
        };

        if vote_granted {
            if req.term > self.current_term && !self.target_state.is_follower() {
                // Granting a newer term deposes us.
                self.set_target_state(State::Follower);
                self.leader_id = None;
            }
            self.voted_for = Some(req.candidate_id);
            self.current_term = req.term;
            self.save_hard_state();
            self.report_metrics();
        }

        tracing::info!(
            id = self.id,
            request = %req.summary(),
            term = self.current_term,
            vote_granted,
            "vote request"
        );

        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }
}
