//! An append-only, block-structured, crash-tolerant record log.
//!
//! A log is a directory of sequentially numbered files, each made of a fixed
//! number of fixed-size blocks; blocks hold runs of checksummed,
//! variable-length records that may straddle block (and file) boundaries.
//! Every record is addressed by a [`LogPos`] triple
//! `(file_num, block_num, record_num)` and that address is stable across
//! restarts, truncation of a suffix, and corruption of other records.
//!
//! ```no_run
//! use recordlog::{LogWriter, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_FILE};
//!
//! let mut writer = LogWriter::new(
//!     "/var/lib/mylog",
//!     "events",
//!     DEFAULT_BLOCK_SIZE,
//!     DEFAULT_BLOCKS_PER_FILE,
//!     false,
//!     false,
//! );
//! writer.initialize().unwrap();
//! let pos = writer.tell();
//! writer.write_record(b"hello").unwrap();
//! writer.flush(true).unwrap();
//!
//! let mut reader = writer.new_reader();
//! reader.seek(pos).unwrap();
//! assert_eq!(reader.get_next_record(), Some(b"hello".to_vec()));
//! ```

mod error;
mod pos;
mod reader;
mod record;
mod util;
mod writer;

pub use error::LogError;
pub use error::Result;
pub use pos::LogPos;
pub use reader::LogReader;
pub use record::FRAGMENT_HEADER_SIZE;
pub use util::clean_log;
pub use util::count_records;
pub use util::detect_log_settings;
pub use util::log_exists;
pub use util::LogSettings;
pub use writer::LogWriter;

/// Default block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default number of blocks per log file.
pub const DEFAULT_BLOCKS_PER_FILE: usize = 1 << 14;
