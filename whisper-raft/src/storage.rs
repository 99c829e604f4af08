//! Durable state: the operation log and the Raft state file.

use std::fs;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use recordlog::LogPos;
use recordlog::LogReader;
use recordlog::LogWriter;
use serde::Deserialize;
use serde::Serialize;

use crate::message::DataEntry;
use crate::NodeId;

/// The state a node must not lose across restarts.
///
/// Rewritten in full (write-temp, then atomic rename) after every transition
/// that changes any field; the rename is the commit point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftState {
    pub current_term: i64,
    pub voted_for: Option<NodeId>,
    pub last_log_pos: LogPos,
    pub last_log_term: i64,
    pub commit_pos: LogPos,
}

/// The Raft node's storage: a [`LogWriter`] for the operation log, a private
/// [`LogReader`] for reconciliation reads, and the `_raft_state_<base>`
/// file.
pub struct RaftLog {
    writer: LogWriter,
    reader: LogReader,
    state_path: PathBuf,
    state_tmp_path: PathBuf,
}

impl RaftLog {
    /// Initialize the log writer (creating the directory and taking the
    /// writer lock) and set up the state file paths.
    pub fn open(mut writer: LogWriter) -> Result<Self> {
        writer.initialize().context("initializing log writer")?;
        let state_path = writer
            .log_dir()
            .join(format!("_raft_state_{}", writer.file_base()));
        let state_tmp_path = writer
            .log_dir()
            .join(format!("_raft_state_{}_tmp", writer.file_base()));
        let reader = writer.new_reader();
        Ok(Self {
            writer,
            reader,
            state_path,
            state_tmp_path,
        })
    }

    pub fn file_base(&self) -> &str {
        self.writer.file_base()
    }

    /// The position the next appended entry will receive.
    pub fn tell(&self) -> LogPos {
        self.writer.tell()
    }

    /// A fresh reader over this log (the leader keeps one per peer).
    pub fn new_reader(&self) -> LogReader {
        self.writer.new_reader()
    }

    /// Append one entry. The entry's self-described position must equal the
    /// writer's; anything else means the caller's cursor went astray.
    pub fn append(&mut self, entry: &DataEntry) -> Result<LogPos> {
        let tell = self.writer.tell();
        if entry.pos != tell {
            return Err(anyhow!(
                "entry position {} does not match log position {}",
                entry.pos,
                tell
            ));
        }
        self.writer.write_record(&entry.encode())?;
        Ok(tell)
    }

    pub fn flush(&mut self, sync: bool) -> Result<()> {
        Ok(self.writer.flush(sync)?)
    }

    /// Read the entry stored at `pos`, returning it together with the
    /// position immediately after it.
    pub fn read_entry_at(&mut self, pos: LogPos) -> Result<(DataEntry, LogPos)> {
        self.reader.seek(pos)?;
        let record = self
            .reader
            .get_next_record()
            .ok_or_else(|| anyhow!("no entry at {}", pos))?;
        let entry = DataEntry::decode(&record).with_context(|| format!("entry at {}", pos))?;
        Ok((entry, self.reader.tell()))
    }

    /// Discard every record at and after `pos`, at record granularity.
    ///
    /// The underlying file truncation is block-aligned; when `pos` points
    /// into the middle of a block, the records of that block before `pos`
    /// are read out, the block is truncated away, and the kept records are
    /// re-appended. Their recomputed positions are identical, so the prefix
    /// of the log is unchanged.
    pub fn truncate_suffix(&mut self, pos: LogPos) -> Result<()> {
        let result = self.truncate_suffix_inner(pos);
        // Truncation deletes and recreates files; a reader holding the old
        // inode would silently serve the discarded suffix.
        self.reader = self.writer.new_reader();
        result
    }

    fn truncate_suffix_inner(&mut self, pos: LogPos) -> Result<()> {
        if pos.record_num == 0 {
            self.writer.truncate_at(pos)?;
            return Ok(());
        }
        let block_start = LogPos::new(pos.file_num, pos.block_num, 0);
        let mut kept = Vec::with_capacity(pos.record_num as usize);
        self.reader.seek(block_start)?;
        for n in 0..pos.record_num {
            let record = self
                .reader
                .get_next_record()
                .ok_or_else(|| anyhow!("record {} of block at {} missing", n, block_start))?;
            kept.push(record);
        }
        self.writer.truncate_at(block_start)?;
        for record in &kept {
            self.writer.write_record(record)?;
        }
        self.writer.flush(true)?;
        let tell = self.writer.tell();
        if tell != pos {
            return Err(anyhow!(
                "truncation replay ended at {} instead of {}",
                tell,
                pos
            ));
        }
        Ok(())
    }

    /// Load the persisted Raft state, `None` when no state file exists.
    pub fn load_state(&self) -> Result<Option<RaftState>> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state = bincode::deserialize(&bytes)
            .with_context(|| format!("parsing {}", self.state_path.display()))?;
        Ok(Some(state))
    }

    /// Persist the Raft state through the temp file + rename commit point.
    ///
    /// A node that cannot persist its state must not keep serving; failures
    /// here abort the process.
    pub fn save_state(&self, state: &RaftState) {
        let bytes = bincode::serialize(state).expect("RaftState is always encodable");
        if let Err(err) = fs::write(&self.state_tmp_path, &bytes) {
            panic!(
                "cannot write state file {}: {}",
                self.state_tmp_path.display(),
                err
            );
        }
        if let Err(err) = fs::rename(&self.state_tmp_path, &self.state_path) {
            panic!(
                "cannot rename state file {} -> {}: {}",
                self.state_tmp_path.display(),
                self.state_path.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_log(dir: &std::path::Path) -> RaftLog {
        let writer = LogWriter::new(dir, "raft", 128, 8, false, false);
        RaftLog::open(writer).unwrap()
    }

    fn entry(pos: LogPos, prev: LogPos, term: i64, prev_term: i64, data: &[u8]) -> DataEntry {
        DataEntry {
            pos,
            last_log_pos: prev,
            term,
            last_log_term: prev_term,
            data: data.to_vec(),
        }
    }

    #[test]
    fn append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(dir.path());

        let first = entry(log.tell(), LogPos::null(), 1, 0, b"x");
        log.append(&first).unwrap();
        log.flush(true).unwrap();
        let second = entry(log.tell(), first.pos, 1, 1, b"y");
        log.append(&second).unwrap();
        log.flush(true).unwrap();

        let (read, after) = log.read_entry_at(first.pos).unwrap();
        assert_eq!(read, first);
        assert_eq!(after, second.pos);
        let (read, after) = log.read_entry_at(second.pos).unwrap();
        assert_eq!(read, second);
        assert_eq!(after, log.tell());
    }

    #[test]
    fn append_rejects_misplaced_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(dir.path());
        let wrong = entry(LogPos::new(0, 0, 5), LogPos::null(), 1, 0, b"x");
        assert!(log.append(&wrong).is_err());
    }

    #[test]
    fn truncate_suffix_keeps_block_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(dir.path());

        let first = entry(log.tell(), LogPos::null(), 1, 0, b"x");
        log.append(&first).unwrap();
        log.flush(true).unwrap();
        let stale = entry(log.tell(), first.pos, 1, 1, b"stale");
        log.append(&stale).unwrap();
        log.flush(true).unwrap();
        assert_eq!(stale.pos, LogPos::new(0, 0, 1));

        log.truncate_suffix(stale.pos).unwrap();
        assert_eq!(log.tell(), stale.pos);

        // The first entry survived byte for byte; the stale one is gone.
        let (read, after) = log.read_entry_at(first.pos).unwrap();
        assert_eq!(read, first);
        assert_eq!(after, stale.pos);
        assert!(log.read_entry_at(stale.pos).is_err());

        // And the freed position is reused by the replacement entry.
        let replacement = entry(log.tell(), first.pos, 2, 1, b"y");
        log.append(&replacement).unwrap();
        log.flush(true).unwrap();
        let (read, _) = log.read_entry_at(stale.pos).unwrap();
        assert_eq!(read, replacement);
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log(dir.path());
        assert_eq!(log.load_state().unwrap(), None);

        let state = RaftState {
            current_term: 3,
            voted_for: Some(1),
            last_log_pos: LogPos::new(0, 0, 2),
            last_log_term: 3,
            commit_pos: LogPos::new(0, 0, 1),
        };
        log.save_state(&state);
        assert_eq!(log.load_state().unwrap(), Some(state));
    }
}
