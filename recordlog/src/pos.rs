//! Log positions.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The address of a record inside a log.
///
/// A log is a sequence of numbered files, each made of fixed-size blocks,
/// each block holding a run of variable-length records. A position is the
/// triple of those three coordinates. The total order over positions is
/// lexicographic on `(file_num, block_num, record_num)`.
///
/// The null position (`file_num == -1`) addresses the point before any
/// record and compares less than every non-null position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "LogPosRepr", into = "LogPosRepr")]
pub struct LogPos {
    pub file_num: i32,
    pub block_num: i32,
    pub record_num: i32,
}

/// The wire shape of a `LogPos`: three integers plus an explicit null flag.
/// A null position encodes as `is_null = true` with all fields default.
#[derive(Serialize, Deserialize)]
struct LogPosRepr {
    #[serde(default)]
    is_null: bool,
    #[serde(default)]
    file_num: i32,
    #[serde(default)]
    block_num: i32,
    #[serde(default)]
    record_num: i32,
}

impl From<LogPosRepr> for LogPos {
    fn from(repr: LogPosRepr) -> Self {
        if repr.is_null {
            LogPos::null()
        } else {
            LogPos::new(repr.file_num, repr.block_num, repr.record_num)
        }
    }
}

impl From<LogPos> for LogPosRepr {
    fn from(pos: LogPos) -> Self {
        if pos.is_null() {
            LogPosRepr {
                is_null: true,
                file_num: 0,
                block_num: 0,
                record_num: 0,
            }
        } else {
            LogPosRepr {
                is_null: false,
                file_num: pos.file_num,
                block_num: pos.block_num,
                record_num: pos.record_num,
            }
        }
    }
}

impl LogPos {
    pub fn new(file_num: i32, block_num: i32, record_num: i32) -> Self {
        Self {
            file_num,
            block_num,
            record_num,
        }
    }

    /// The position before any record.
    pub fn null() -> Self {
        Self {
            file_num: -1,
            block_num: 0,
            record_num: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.file_num == -1
    }
}

impl Default for LogPos {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "({},{},{})", self.file_num, self.block_num, self.record_num)
        }
    }
}

impl fmt::Debug for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
