//! Write-ahead log.
//!
//! - `entry`: LSNs, entry kinds and the on-disk frame format
//! - `segment`: chunk files, the dead-file pool and the reopen scan
//! - `manager`: the append/force/read/truncate façade over the ring buffer

pub mod entry;
pub mod manager;
pub mod segment;

pub use entry::{EntryHeader, EntryKind, LogEntry, Lsn, Xid, NO_XID};
pub use manager::{
    CommitDurability, EntryReservation, ForceMode, LogConfig, LogCursor, LogManager, LogStats,
    RecLsnSource,
};
