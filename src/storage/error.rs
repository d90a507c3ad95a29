//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;
use crate::storage::ring::RingError;
use crate::storage::wal::Lsn;

/// Errors raised by the write-ahead log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("log corruption at {lsn}: {reason}")]
    Corruption { lsn: Lsn, reason: String },

    #[error("{lsn} precedes the truncation point {truncation_point}")]
    Truncated { lsn: Lsn, truncation_point: Lsn },

    #[error("{lsn} is at or beyond the end of the log ({next})")]
    BeyondEnd { lsn: Lsn, next: Lsn },

    #[error("no entry starts at {0}")]
    NotAnEntry(Lsn),

    #[error("cannot truncate to {requested}: entries from {limit} onward are still needed")]
    TruncationBeyondRecLsn { requested: Lsn, limit: Lsn },

    #[error("entry of {size} bytes exceeds the maximum of {max}")]
    EntryTooLarge { size: usize, max: usize },

    #[error("invalid log configuration: {0}")]
    InvalidConfig(String),

    #[error("log handle is unusable after an earlier I/O failure")]
    Poisoned,

    #[error("log has been closed")]
    Closed,

    #[error("ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised by the buffer manager and the dirty page table.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("page {0} is latched by another thread")]
    Busy(PageId),

    #[error("page {0} is not resident")]
    NotResident(PageId),

    #[error("page {0} is pinned by the calling thread")]
    PinnedByCaller(PageId),

    #[error("page {page_id} dirty since {lsn} is still pinned after {waited_ms}ms")]
    Stuck {
        page_id: PageId,
        lsn: Lsn,
        waited_ms: u128,
    },

    #[error("buffer manager has been closed")]
    Closed,

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
