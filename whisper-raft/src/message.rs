//! Wire messages of the `raft.Raft` service.

use recordlog::LogPos;
use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// A terse one-line rendering for tracing output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// The payload stored in the replicated log, one per client write.
///
/// Each entry is self-describing: it carries the position it is stored at
/// and the position/term of the entry preceding it, so a leader can walk a
/// follower's log backwards during reconciliation without any index math.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    /// Where this entry lives in the log.
    pub pos: LogPos,
    /// Position of the preceding entry (null for the first).
    pub last_log_pos: LogPos,
    /// Term in which this entry was created.
    pub term: i64,
    /// Term of the preceding entry.
    pub last_log_term: i64,
    /// Opaque client payload.
    pub data: Vec<u8>,
}

impl DataEntry {
    /// Serialize for storage in the record log.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("DataEntry is always encodable")
    }

    /// Deserialize a record read back from the log.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl MessageSummary for DataEntry {
    fn summary(&self) -> String {
        format!("{}@t{}:{}b", self.pos, self.term, self.data.len())
    }
}

/// Sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: i64,
    pub candidate_id: NodeId,
    pub last_log_term: i64,
    pub last_log_pos: LogPos,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={} candidate={} last={}@t{}",
            self.term, self.candidate_id, self.last_log_pos, self.last_log_term
        )
    }
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responder's current term, for the candidate to update itself.
    pub term: i64,
    pub vote_granted: bool,
}

/// Sent by the leader to replicate log entries; with an empty entry list it
/// doubles as a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: i64,
    pub leader_id: NodeId,
    /// Term of the entry immediately preceding `entry`.
    pub last_log_term: i64,
    /// Position of the entry immediately preceding `entry`.
    pub last_log_pos: LogPos,
    pub leader_commit_pos: LogPos,
    #[serde(rename = "entry")]
    pub entries: Vec<DataEntry>,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev={}@t{} commit={} n={}",
            self.term,
            self.leader_id,
            self.last_log_pos,
            self.last_log_term,
            self.leader_commit_pos,
            self.entries.len()
        )
    }
}

/// The response to an [`AppendEntriesRequest`].
///
/// `current_pos` and `commit_pos` are filled whenever the request was
/// processed (success or log mismatch); the leader uses them to rewind its
/// cursor quickly. They stay empty on a stale-term rejection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: i64,
    pub success: bool,
    /// The responder's `LogWriter::tell()`.
    pub current_pos: Option<LogPos>,
    pub commit_pos: Option<LogPos>,
}

impl MessageSummary for AppendEntriesResponse {
    fn summary(&self) -> String {
        format!(
            "term={} success={} current={:?} commit={:?}",
            self.term, self.success, self.current_pos, self.commit_pos
        )
    }
}

/// A client write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub data: Vec<u8>,
    /// When set, the reply is withheld until the entry commits.
    pub wait_to_commit: bool,
}

/// The response to a [`SaveRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub term: i64,
    /// Position the entry was written at; absent when the write was not
    /// accepted.
    pub pos: Option<LogPos>,
    /// Hint naming the current leader, for redirects from a follower.
    pub leader_name: Option<String>,
    pub was_committed: Option<bool>,
}
