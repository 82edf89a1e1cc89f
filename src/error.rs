use thiserror::Error;

/// The kinds of failure the engine can report, per the error handling design:
/// I/O faults abort the in-flight mutation while leaving the last committed
/// header durable; `NotFound` is only an error for `fetch`; `PendingCompaction`
/// guards against overlapping compactions; `InvalidConfig` rejects bad
/// `auto_compact` settings; `UserError` wraps a panic/error raised inside a
/// caller-supplied closure; `Timeout` is surfaced at the API boundary only,
/// the background work it was waiting on keeps running.
#[derive(Error, Debug)]
pub enum ErrorCode {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("key not found")]
    NotFound,

    #[error("a compaction is already in progress")]
    PendingCompaction,

    #[error("invalid auto_compact configuration: {0}")]
    InvalidConfig(String),

    #[error("user function failed: {0}")]
    UserError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("corrupt node at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("coordinator is no longer running")]
    CoordinatorGone,
}

pub type Result<T> = std::result::Result<T, ErrorCode>;

impl From<bincode::Error> for ErrorCode {
    fn from(e: bincode::Error) -> Self {
        ErrorCode::Corrupt { offset: 0, reason: e.to_string() }
    }
}
