//! The log writer.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::error::LogError;
use crate::error::Result;
use crate::pos::LogPos;
use crate::reader::LogReader;
use crate::record::RecordWriter;
use crate::util::compose_file_name;
use crate::util::list_file_nums;

/// Appends records to a log directory.
///
/// A log is a run of numbered files of exactly `blocks_per_file` blocks of
/// `block_size` bytes. The writer owns the current partially-filled block:
/// [`LogWriter::flush`] writes a padded copy of it at its fixed offset, but
/// the block stays current and later appends keep packing into it, so the
/// files on disk always contain whole blocks while record positions stay
/// dense. A directory-level `<base>.lock` file holding the writer's PID
/// keeps a second writer out; the check is advisory (see `initialize`).
pub struct LogWriter {
    log_dir: PathBuf,
    file_base: String,
    block_size: usize,
    blocks_per_file: usize,
    temp_incomplete: bool,

    file: Option<File>,
    file_num: i32,
    /// Index of the current (partially-filled) block in the current file.
    block_index: usize,
    /// Full blocks emitted by the recorder but not yet on disk. Non-empty
    /// only while recovering from a write failure.
    pending: Vec<Vec<u8>>,
    recorder: RecordWriter,
}

impl LogWriter {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        file_base: impl Into<String>,
        block_size: usize,
        blocks_per_file: usize,
        temp_incomplete: bool,
        deflate: bool,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            file_base: file_base.into(),
            block_size,
            blocks_per_file,
            temp_incomplete,
            file: None,
            file_num: -1,
            block_index: 0,
            pending: Vec::new(),
            recorder: RecordWriter::new(block_size, deflate),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn file_base(&self) -> &str {
        &self.file_base
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_per_file(&self) -> usize {
        self.blocks_per_file
    }

    /// Create the directory, acquire the PID lock, and open the
    /// highest-numbered file for append.
    ///
    /// Fails with [`LogError::Locked`] while the process named in an
    /// existing lock file is alive. The check is PID-based and inherently
    /// racy; it protects against accidents, not against operators starting
    /// two writers on purpose.
    pub fn initialize(&mut self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        self.acquire_lock()?;

        self.file_num = list_file_nums(&self.log_dir, &self.file_base, self.block_size)
            .last()
            .copied()
            .unwrap_or(0);

        if self.temp_incomplete {
            fs::create_dir_all(self.log_dir.join("temp"))?;
        }
        self.open_next_log()
    }

    /// A reader over the same log.
    pub fn new_reader(&self) -> LogReader {
        LogReader::new(
            &self.log_dir,
            &self.file_base,
            self.block_size,
            self.blocks_per_file,
        )
    }

    /// The position the next appended record will receive.
    pub fn tell(&self) -> LogPos {
        let mut file_num = self.file_num.max(0);
        let mut block = self.block_index + self.pending.len();
        while block >= self.blocks_per_file {
            block -= self.blocks_per_file;
            file_num += 1;
        }
        LogPos::new(file_num, block as i32, self.recorder.pending_record_count())
    }

    /// Buffer one record; full blocks are written out as they fill.
    pub fn write_record(&mut self, data: &[u8]) -> Result<()> {
        if self.file.is_none() {
            self.open_next_log()?;
        }
        self.recorder.append_record(data, &mut self.pending);
        self.write_pending()
    }

    /// Write the padded current block to disk; `sync` also flushes the OS
    /// buffers. The block stays current for further appends.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        self.write_pending()?;
        if let Some(snapshot) = self.recorder.finalize_content() {
            self.write_block_at(self.block_index, &snapshot)?;
        }
        if sync {
            if let Some(file) = &self.file {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// Discard all data at and after `pos` and reopen for append there.
    ///
    /// Only block-aligned truncation is supported (`pos.record_num` must be
    /// zero), and never with temporary-incomplete files. A null `pos`
    /// discards the whole log.
    pub fn truncate_at(&mut self, pos: LogPos) -> Result<()> {
        if self.temp_incomplete {
            return Err(LogError::TruncateWithTempFiles);
        }
        if pos.record_num != 0 {
            return Err(LogError::TruncateUnaligned(pos));
        }
        if self.file.is_none() {
            return Err(LogError::NotInitialized);
        }
        tracing::info!(log = %self.file_base, %pos, "truncating log");
        self.flush(false)?;
        self.close_log();

        let start_delete = if pos.is_null() {
            0
        } else if pos.block_num == 0 {
            pos.file_num
        } else {
            pos.file_num + 1
        };
        for num in list_file_nums(&self.log_dir, &self.file_base, self.block_size) {
            if num < start_delete {
                continue;
            }
            let path = compose_file_name(&self.log_dir, &self.file_base, self.block_size, num);
            if let Err(err) = fs::remove_file(&path) {
                tracing::error!(path = %path.display(), %err, "cannot delete log file");
            }
        }
        if pos.block_num > 0 {
            let path =
                compose_file_name(&self.log_dir, &self.file_base, self.block_size, pos.file_num);
            let file = OpenOptions::new().write(true).create(true).open(&path)?;
            file.set_len((pos.block_num as usize * self.block_size) as u64)?;
        }

        self.file_num = pos.file_num.max(0);
        self.recorder.clear();
        self.pending.clear();
        self.open_next_log()
    }

    /// Flush everything, close the current file, and release the lock.
    pub fn close(&mut self) {
        if self.file.is_none() {
            return;
        }
        if let Err(err) = self.flush(false) {
            tracing::error!(log = %self.file_base, %err, "flush on close failed");
        }
        self.close_log();
        let _ = fs::remove_file(self.lock_path());
    }

    fn lock_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.lock", self.file_base))
    }

    fn acquire_lock(&self) -> Result<()> {
        let path = self.lock_path();
        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut contents = String::new();
        lock_file.read_to_string(&mut contents)?;
        if let Ok(pid) = contents.trim().parse::<u32>() {
            if pid != 0 && Path::new(&format!("/proc/{}", pid)).exists() {
                tracing::error!(lock = %path.display(), pid, "log writer already in use");
                return Err(LogError::Locked { pid });
            }
        }
        lock_file.seek(SeekFrom::Start(0))?;
        let pid = std::process::id().to_string();
        lock_file.write_all(pid.as_bytes())?;
        lock_file.set_len(pid.len() as u64)?;
        tracing::debug!(lock = %path.display(), "created lock file");
        Ok(())
    }

    /// The path of the current file: under `temp/` in temporary-incomplete
    /// mode, in place otherwise.
    fn current_file_path(&self) -> PathBuf {
        if self.temp_incomplete {
            compose_file_name(
                &self.log_dir.join("temp"),
                &self.file_base,
                self.block_size,
                self.file_num,
            )
        } else {
            compose_file_name(&self.log_dir, &self.file_base, self.block_size, self.file_num)
        }
    }

    fn open_next_log(&mut self) -> Result<()> {
        if self.file_num < 0 {
            return Err(LogError::NotInitialized);
        }
        loop {
            if self.file.is_some() {
                self.close_log();
                self.file_num += 1;
            }
            let path = self.current_file_path();
            let file = OpenOptions::new().write(true).create(true).open(&path)?;
            let mut size = file.metadata()?.len() as usize;
            if size % self.block_size != 0 {
                tracing::warn!(
                    path = %path.display(),
                    size,
                    block_size = self.block_size,
                    "invalid file size, truncating to a block multiple; possible data loss"
                );
                size = (size / self.block_size) * self.block_size;
                file.set_len(size as u64)?;
            }
            self.block_index = size / self.block_size;
            self.file = Some(file);
            if self.block_index < self.blocks_per_file {
                tracing::debug!(path = %path.display(), size, "log file opened for append");
                return Ok(());
            }
            // File already complete; roll to the next one.
        }
    }

    fn close_log(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        if self.temp_incomplete {
            let from = self.current_file_path();
            let to =
                compose_file_name(&self.log_dir, &self.file_base, self.block_size, self.file_num);
            if from != to {
                if let Err(err) = fs::rename(&from, &to) {
                    tracing::error!(
                        from = %from.display(),
                        to = %to.display(),
                        %err,
                        "cannot move temporary log file in place"
                    );
                }
            }
        }
    }

    /// Drain retired full blocks to disk, rolling files as they complete.
    fn write_pending(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let block = self.pending.remove(0);
            if let Err(err) = self.write_block_at(self.block_index, &block) {
                self.pending.insert(0, block);
                return Err(err);
            }
            self.block_index += 1;
            if self.block_index == self.blocks_per_file {
                tracing::info!(
                    path = %self.current_file_path().display(),
                    "log file complete, rolling to the next one"
                );
                self.close_log();
                self.file_num += 1;
                self.open_next_log()?;
            }
        }
        Ok(())
    }

    /// Write one whole block at its offset. A failed or short write
    /// truncates the file back to the block boundary so no torn block is
    /// ever visible; the caller's buffers are left intact for a retry.
    fn write_block_at(&mut self, index: usize, block: &[u8]) -> Result<()> {
        debug_assert_eq!(block.len(), self.block_size);
        let offset = (index * self.block_size) as u64;
        let file = self.file.as_mut().ok_or(LogError::NotInitialized)?;
        file.seek(SeekFrom::Start(offset))?;
        if let Err(err) = file.write_all(block) {
            tracing::error!(%err, "block write failed, restoring file length");
            let _ = file.set_len(offset);
            let _ = file.seek(SeekFrom::Start(offset));
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.close();
    }
}
