use crate::pos::LogPos;

/// Errors surfaced by the log writer and reader.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log is locked by live process {pid}")]
    Locked { pid: u32 },

    #[error("cannot seek to {0}")]
    InvalidSeek(LogPos),

    #[error("truncation position {0} is not block-aligned")]
    TruncateUnaligned(LogPos),

    #[error("cannot truncate a log written with temporary incomplete files")]
    TruncateWithTempFiles,

    #[error("log writer is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;
