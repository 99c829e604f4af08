//! Log directory maintenance helpers.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::pos::LogPos;
use crate::reader::LogReader;

/// Settings recovered from the files already present in a log directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub file_base: String,
    pub block_size: usize,
    pub blocks_per_file: usize,
}

/// `<dir>/<base>_<block_size:010>_<file_num:010>`
pub(crate) fn compose_file_name(
    dir: &Path,
    file_base: &str,
    block_size: usize,
    file_num: i32,
) -> PathBuf {
    dir.join(format!("{}_{:010}_{:010}", file_base, block_size, file_num))
}

/// Parse `file_num` out of a log file name for the given base and block size.
pub(crate) fn parse_file_num(name: &str, file_base: &str, block_size: usize) -> Option<i32> {
    let prefix = format!("{}_{:010}_", file_base, block_size);
    let digits = name.strip_prefix(&prefix)?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// All log file numbers present in `dir` for this base/block size, sorted.
pub(crate) fn list_file_nums(dir: &Path, file_base: &str, block_size: usize) -> Vec<i32> {
    let mut nums = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(num) = parse_file_num(name, file_base, block_size) {
                    nums.push(num);
                }
            }
        }
    }
    nums.sort_unstable();
    nums
}

/// Whether the numbered log file exists.
pub fn log_exists(dir: &Path, file_base: &str, block_size: usize, file_num: i32) -> bool {
    compose_file_name(dir, file_base, block_size, file_num).exists()
}

/// Delete whole log files strictly before `first_pos` (positions at or after
/// `first_pos` stay seekable). Returns how many files were deleted.
pub fn clean_log(dir: &Path, file_base: &str, first_pos: LogPos, block_size: usize) -> usize {
    let mut num_deleted = 0;
    for num in list_file_nums(dir, file_base, block_size) {
        if num >= first_pos.file_num {
            break;
        }
        let path = compose_file_name(dir, file_base, block_size, num);
        match fs::remove_file(&path) {
            Ok(()) => num_deleted += 1,
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "cannot delete log file");
            }
        }
    }
    num_deleted
}

/// Recover `(file_base, block_size, blocks_per_file)` from the files in a log
/// directory. Returns `None` when no log files are present or the layout
/// cannot be determined.
pub fn detect_log_settings(dir: &Path) -> Option<LogSettings> {
    let mut candidates: Vec<(String, String)> = Vec::new();
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let name = match entry.file_name().to_str() {
            Some(name) => name.to_string(),
            None => continue,
        };
        // <base>_<10 digits>_<10 digits>
        if name.len() < 22 {
            continue;
        }
        let (head, num) = name.split_at(name.len() - 11);
        if !num.starts_with('_') || !num[1..].bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let (base, bs) = head.split_at(head.len() - 11);
        if !bs.starts_with('_') || !bs[1..].bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        candidates.push((base.to_string(), name.clone()));
    }
    candidates.sort();
    let (file_base, first) = candidates.into_iter().next()?;

    let block_size: usize = first[first.len() - 21..first.len() - 11]
        .trim_start_matches('_')
        .parse()
        .ok()?;
    if block_size == 0 {
        return None;
    }
    let size = fs::metadata(dir.join(&first)).ok()?.len() as usize;
    if size % block_size != 0 {
        tracing::error!(
            file = %first,
            size,
            block_size,
            "log file size is not a multiple of the block size"
        );
    }
    let blocks_per_file = size / block_size;
    if blocks_per_file == 0 {
        return None;
    }
    Some(LogSettings {
        file_base,
        block_size,
        blocks_per_file,
    })
}

/// Drain the reader counting records, then rewind it.
pub fn count_records(reader: &mut LogReader) -> u64 {
    let mut count = 0;
    while reader.get_next_record().is_some() {
        count += 1;
    }
    reader.rewind();
    count
}
