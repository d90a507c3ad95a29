//! Storage layer of the runtime.
//!
//! - **ring**: bounded byte ring shared by log appenders and the log writer
//! - **wal**: write-ahead log on top of the ring and fixed-size chunk files
//! - **dirty**: dirty page table with by-page and by-LSN indices
//! - **buffer**: fixed pool of page frames with LRU eviction and
//!   background write-back
//! - **handle**: where pages live when they are not cached
//!
//! Every page write-back forces the log up to the page's LSN first.

pub mod buffer;
pub mod dirty;
pub mod error;
pub mod handle;
pub mod page;
pub mod ring;
pub mod wal;

pub use buffer::{BufferConfig, BufferManager, PageReadGuard, PageWriteGuard};
pub use dirty::{DirtyPageTable, DirtyTableConfig, PageWriter};
pub use error::{BufferError, LogError, StorageError, StorageResult};
pub use handle::{FilePageHandle, MemoryPageHandle, PageHandle};
pub use page::{Page, PageId, PageType, PAGE_SIZE};
pub use ring::{ConsumeLen, RingBuffer, RingError};
pub use wal::{ForceMode, LogConfig, LogManager, Lsn};
