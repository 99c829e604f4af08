//! The log reader.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::PathBuf;

use crate::error::LogError;
use crate::error::Result;
use crate::pos::LogPos;
use crate::record::ReadOutcome;
use crate::record::RecordReader;
use crate::util::compose_file_name;
use crate::util::list_file_nums;

/// Streams records out of a log directory.
///
/// The reader is positional: [`LogReader::seek`] places it at any valid
/// [`LogPos`], [`LogReader::get_next_record`] returns records in order, and
/// [`LogReader::tell`] reports the position of the next record to read.
/// Corrupted records are skipped (counted in [`LogReader::num_errors`]);
/// running out of data is not an error, the next file may simply not have
/// been written yet.
pub struct LogReader {
    log_dir: PathBuf,
    file_base: String,
    block_size: usize,
    blocks_per_file: usize,

    file: Option<File>,
    /// Current file number; -1 until the first rewind finds a file.
    file_num: i32,
    /// The block holding the next record to read. Transiently equal to
    /// `blocks_per_file` while waiting for the next file to appear.
    block_num: i32,
    /// Completed records that began in the current block.
    record_num: i32,
    /// Whether the current block's content is loaded in `records`.
    block_loaded: bool,
    /// Where the record currently under assembly began.
    pending_start: Option<(i32, i32)>,

    records: RecordReader,
    num_errors: u64,
    block_buf: Vec<u8>,
}

enum NextRecord {
    Record { data: Vec<u8>, start: (i32, i32) },
    NoData,
}

impl LogReader {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        file_base: impl Into<String>,
        block_size: usize,
        blocks_per_file: usize,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            file_base: file_base.into(),
            block_size,
            blocks_per_file,
            file: None,
            file_num: -1,
            block_num: 0,
            record_num: 0,
            block_loaded: false,
            pending_start: None,
            records: RecordReader::new(block_size),
            num_errors: 0,
            block_buf: vec![0; block_size],
        }
    }

    /// Records skipped because of framing or checksum errors.
    pub fn num_errors(&self) -> u64 {
        self.num_errors
    }

    /// The position of the next record [`LogReader::get_next_record`] will
    /// return.
    pub fn tell(&self) -> LogPos {
        if self.file_num < 0 {
            return LogPos::null();
        }
        if self.block_num as usize >= self.blocks_per_file {
            return LogPos::new(self.file_num + 1, 0, 0);
        }
        LogPos::new(self.file_num, self.block_num, self.record_num)
    }

    /// Position at `pos`.
    ///
    /// A null position rewinds to the first existing file. A position at
    /// `(f, 0, 0)` where file `f` does not exist yet but `f - 1` does is
    /// accepted: it addresses the current end of the log. On failure the
    /// reader is rewound.
    pub fn seek(&mut self, pos: LogPos) -> Result<()> {
        if pos.is_null() {
            self.rewind();
            return Ok(());
        }
        if pos.block_num == 0
            && pos.record_num == 0
            && pos.file_num > 0
            && self.file_exists(pos.file_num - 1)
            && !self.file_exists(pos.file_num)
        {
            self.close_internal();
            self.file_num = pos.file_num;
            return Ok(());
        }
        if let Err(err) = self.open_file(pos.file_num) {
            tracing::error!(%pos, %err, "seek failed, cannot open log file");
            self.rewind();
            return Err(LogError::InvalidSeek(pos));
        }
        if !self.advance_to_pos(pos) {
            tracing::error!(%pos, "seek failed, cannot advance to position");
            self.rewind();
            return Err(LogError::InvalidSeek(pos));
        }
        Ok(())
    }

    /// The next record, or `None` when no more data is currently present.
    pub fn get_next_record(&mut self) -> Option<Vec<u8>> {
        match self.next_internal() {
            NextRecord::Record { data, .. } => Some(data),
            NextRecord::NoData => None,
        }
    }

    /// Position at the first existing file; with no files yet, the next
    /// [`LogReader::get_next_record`] will scan again.
    pub fn rewind(&mut self) {
        self.close_internal();
        let nums = list_file_nums(&self.log_dir, &self.file_base, self.block_size);
        match nums.first() {
            Some(first) => {
                self.file_num = *first;
            }
            None => {
                tracing::debug!(
                    dir = %self.log_dir.display(),
                    base = %self.file_base,
                    "no log files yet"
                );
            }
        }
    }

    fn file_path(&self, file_num: i32) -> PathBuf {
        compose_file_name(&self.log_dir, &self.file_base, self.block_size, file_num)
    }

    fn file_exists(&self, file_num: i32) -> bool {
        self.file_path(file_num).exists()
    }

    fn close_internal(&mut self) {
        self.file = None;
        self.file_num = -1;
        self.block_num = 0;
        self.record_num = 0;
        self.block_loaded = false;
        self.pending_start = None;
        self.records.clear();
    }

    /// Open the given file for a fresh positioned read (drops all state).
    fn open_file(&mut self, file_num: i32) -> Result<()> {
        if self.file.is_some() && self.file_num == file_num {
            return Ok(());
        }
        self.close_internal();
        // Keep the target file number so a later retry attempts it again.
        self.file_num = file_num;
        let path = self.file_path(file_num);
        self.file = Some(OpenOptions::new().read(true).open(&path)?);
        Ok(())
    }

    /// Skip to `pos` inside the already-open file.
    fn advance_to_pos(&mut self, pos: LogPos) -> bool {
        debug_assert_eq!(self.file_num, pos.file_num);
        self.records.clear();
        self.pending_start = None;
        self.block_num = pos.block_num;
        self.record_num = 0;
        self.block_loaded = false;

        // With record_num == 0 the block itself may not exist yet; loading
        // is deferred to the first read.
        if pos.record_num == 0 {
            return true;
        }
        let target = (pos.file_num, pos.block_num);
        let mut skipped = 0;
        while skipped < pos.record_num {
            match self.next_internal() {
                NextRecord::Record { start, .. } if start == target => skipped += 1,
                NextRecord::Record { .. } => return false,
                NextRecord::NoData => return false,
            }
        }
        true
    }

    fn next_internal(&mut self) -> NextRecord {
        if self.file_num == -1 {
            self.rewind();
            if self.file_num == -1 {
                return NextRecord::NoData;
            }
        }
        if self.file.is_none() {
            match OpenOptions::new().read(true).open(self.file_path(self.file_num)) {
                Ok(file) => self.file = Some(file),
                Err(_) => return NextRecord::NoData,
            }
        }
        loop {
            if !self.block_loaded {
                if !self.read_block() {
                    return NextRecord::NoData;
                }
            }
            match self.records.read_record() {
                ReadOutcome::Record {
                    data,
                    began_in_block,
                } => {
                    let here = (self.file_num, self.block_num);
                    let start = if began_in_block {
                        here
                    } else {
                        self.pending_start.take().unwrap_or(here)
                    };
                    if start == here {
                        self.record_num += 1;
                    }
                    return NextRecord::Record { data, start };
                }
                ReadOutcome::NeedBlock => {
                    if self.records.has_partial() && self.pending_start.is_none() {
                        self.pending_start = Some((self.file_num, self.block_num));
                    }
                    self.block_num += 1;
                    self.record_num = 0;
                    self.block_loaded = false;
                }
                ReadOutcome::Corrupt => {
                    tracing::error!(
                        file = %self.file_path(self.file_num).display(),
                        pos = %self.tell(),
                        "corrupt record skipped"
                    );
                    self.num_errors += 1;
                    self.pending_start = None;
                }
            }
        }
    }

    /// Load the block at `block_num`, rolling to the next file when the
    /// current one is complete. False when the data is not there (yet).
    fn read_block(&mut self) -> bool {
        if self.block_num as usize >= self.blocks_per_file {
            let next = self.file_num + 1;
            match OpenOptions::new().read(true).open(self.file_path(next)) {
                Ok(file) => {
                    // A record may straddle the file boundary: the partial
                    // assembly survives the switch.
                    self.file = Some(file);
                    self.file_num = next;
                    self.block_num = 0;
                    self.record_num = 0;
                }
                Err(_) => return false,
            }
        }
        let offset = (self.block_num as usize * self.block_size) as u64;
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return false,
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        if file.read_exact(&mut self.block_buf).is_err() {
            // Short read: the block is not fully written yet.
            return false;
        }
        self.records.feed_block(&self.block_buf);
        self.block_loaded = true;
        true
    }
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("dir", &self.log_dir)
            .field("base", &self.file_base)
            .field("pos", &self.tell())
            .finish()
    }
}
