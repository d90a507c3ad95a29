//! Write-ahead log façade.
//!
//! Appends go into a shared ring buffer through a two-phase reserve/done
//! protocol, so many threads can log concurrently. A dedicated log-writer
//! thread drains stable spans of the ring into chunk files. `force` waits
//! for a durability point, and concurrent forces share one fsync.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use super::entry::{
    self, frame_len, EntryHeader, EntryKind, LogEntry, Lsn, FRAME_OVERHEAD, MARKER_PAYLOAD_SIZE,
};
use super::segment::{RecoveredLog, SegmentStore};
use crate::storage::error::{LogError, LogResult};
use crate::storage::ring::{ConsumeLen, RingBuffer, RingError, WriteReservation};

/// Smallest chunk the log accepts.
pub const MIN_CHUNK_SIZE: u64 = 256;

/// How far a force has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceMode {
    /// Required before a page carrying a later LSN may be written back.
    /// Always reaches stable storage.
    Wal,
    /// Transaction commit; honours `LogConfig::commit_durability`.
    Commit,
}

/// What a `ForceMode::Commit` force waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitDurability {
    /// The commit entry has been fsynced.
    Sync,
    /// The commit entry has been handed to the operating system.
    Soft,
}

/// Log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the chunk files.
    pub log_dir: PathBuf,
    /// The ring buffer holds `2^ring_capacity_bits` bytes.
    pub ring_capacity_bits: u32,
    /// Size of each chunk file in bytes.
    pub chunk_size: u64,
    /// Durability level of commit forces.
    pub commit_durability: CommitDurability,
    /// How long a commit leader waits for more committers before syncing.
    pub group_commit_window: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_dir: PathBuf::from("wal"),
            ring_capacity_bits: 24,
            chunk_size: 4 * 1024 * 1024,
            commit_durability: CommitDurability::Sync,
            group_commit_window: Duration::ZERO,
        }
    }
}

impl LogConfig {
    /// Config for a log in `log_dir` with default sizes.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        LogConfig {
            log_dir: log_dir.into(),
            ..Default::default()
        }
    }

    /// Check that the sizes fit together.
    pub fn validate(&self) -> LogResult<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(LogError::InvalidConfig(format!(
                "chunk_size {} is below the minimum of {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        let capacity = 1u64
            .checked_shl(self.ring_capacity_bits)
            .filter(|_| self.ring_capacity_bits < 64)
            .ok_or_else(|| {
                LogError::InvalidConfig(format!(
                    "ring_capacity_bits {} is too large",
                    self.ring_capacity_bits
                ))
            })?;
        if capacity < 2 * self.chunk_size {
            return Err(LogError::InvalidConfig(format!(
                "ring capacity {} must be at least twice the chunk size {}",
                capacity, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Largest payload a single entry may carry.
    pub fn max_payload(&self) -> usize {
        self.chunk_size as usize - FRAME_OVERHEAD
    }
}

/// Something that still needs log entries from a given LSN onward.
///
/// The log never truncates past the smallest bound reported by its
/// registered sources.
pub trait RecLsnSource: Send + Sync {
    /// Oldest LSN still needed, or `None` if nothing is needed.
    fn min_rec_lsn(&self) -> Option<Lsn>;
}

/// Counters for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Forces that had to wait for I/O.
    pub forces: u64,
    /// Physical fsync batches issued by force leaders.
    pub syncs: u64,
}

struct Durability {
    /// End of the last CRC marker the log writer has handed to the OS.
    verified: u64,
    /// Bytes below this offset survive a crash.
    synced: u64,
    /// A leader is inside `sync_range`.
    syncing: bool,
    poisoned: bool,
    /// The log writer has exited; nothing will move `verified` again.
    writer_gone: bool,
}

struct LogInner {
    config: LogConfig,
    ring: RingBuffer,
    store: SegmentStore,
    durability: Mutex<Durability>,
    durability_changed: Condvar,
    /// Largest end offset of any marker reserved so far.
    marker_end: AtomicU64,
    truncation_point: AtomicU64,
    rec_lsn_sources: RwLock<Vec<Arc<dyn RecLsnSource>>>,
    discard: AtomicBool,
    closed: AtomicBool,
    forces: AtomicU64,
    syncs: AtomicU64,
}

pub struct LogManager {
    inner: Arc<LogInner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Open or create the log in `config.log_dir`.
    ///
    /// Whatever follows the last verified CRC marker is cut off; appends
    /// continue right after it.
    pub fn open(config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let (store, recovered) = SegmentStore::open(&config.log_dir, config.chunk_size)?;
        let RecoveredLog {
            next_lsn,
            truncation_point,
            ..
        } = recovered;
        let ring = RingBuffer::with_initial_offset(config.ring_capacity_bits, next_lsn.0)?;

        let inner = Arc::new(LogInner {
            config,
            ring,
            store,
            // Recovered bytes only count as durable once synced again.
            durability: Mutex::new(Durability {
                verified: next_lsn.0,
                synced: truncation_point.0,
                syncing: false,
                poisoned: false,
                writer_gone: false,
            }),
            durability_changed: Condvar::new(),
            marker_end: AtomicU64::new(next_lsn.0),
            truncation_point: AtomicU64::new(truncation_point.0),
            rec_lsn_sources: RwLock::new(Vec::new()),
            discard: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            forces: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        });

        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || worker.run_writer())?;

        Ok(Self {
            inner,
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    /// LSN the next entry would receive if it needed no padding.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.inner.ring.write_frontier())
    }

    /// First offset that is not yet durable. Every entry ending at or below
    /// it survives a crash.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.inner.durability.lock().synced)
    }

    /// Oldest offset still held by the log.
    pub fn truncation_point(&self) -> Lsn {
        Lsn(self.inner.truncation_point.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            forces: self.inner.forces.load(Ordering::Relaxed),
            syncs: self.inner.syncs.load(Ordering::Relaxed),
        }
    }

    fn check_open(&self) -> LogResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        if self.inner.store.is_poisoned() {
            return Err(LogError::Poisoned);
        }
        Ok(())
    }

    /// Reserve room for an entry with `payload_len` bytes of payload.
    ///
    /// The LSN is assigned here. Fill the payload, then call
    /// `write_entry_done`. Dropping the reservation instead leaves a no-op
    /// entry in its place.
    pub fn reserve_entry(
        &self,
        header: EntryHeader,
        payload_len: usize,
    ) -> LogResult<EntryReservation<'_>> {
        self.check_open()?;
        let max = self.inner.config.max_payload();
        if payload_len > max {
            return Err(LogError::EntryTooLarge {
                size: payload_len,
                max,
            });
        }

        let chunk = self.inner.config.chunk_size;
        let len = frame_len(payload_len) as u64;
        let reservation = self
            .inner
            .ring
            .reserve_padded(len, |frontier| {
                let used = frontier % chunk;
                if used + len > chunk {
                    chunk - used
                } else {
                    0
                }
            })
            .map_err(|e| match e {
                RingError::Closed => LogError::Closed,
                other => other.into(),
            })?;

        let lsn = Lsn(reservation.payload_offset());
        let mut entry = EntryReservation {
            frame_at: reservation.padding() as usize,
            frame_len: len as usize,
            reservation,
            lsn,
            done: false,
        };
        entry::write_header(entry.frame_mut(), lsn, &header);
        if header.kind == EntryKind::Marker {
            self.inner.marker_end.fetch_max(lsn.0 + len, Ordering::AcqRel);
        }
        trace!("Reserved {:?} entry at {} ({} bytes)", header.kind, lsn, len);
        Ok(entry)
    }

    /// Append a complete entry.
    pub fn append(&self, header: EntryHeader, payload: &[u8]) -> LogResult<Lsn> {
        let mut entry = self.reserve_entry(header, payload.len())?;
        entry.payload_mut().copy_from_slice(payload);
        Ok(entry.write_entry_done())
    }

    fn append_marker(&self) -> LogResult<u64> {
        let entry = self.reserve_entry(EntryHeader::marker(), MARKER_PAYLOAD_SIZE)?;
        let end = entry.lsn().0 + entry.frame_len as u64;
        entry.write_entry_done();
        Ok(end)
    }

    /// Make the entry at `lsn` durable according to `mode`.
    pub fn force(&self, lsn: Lsn, mode: ForceMode) -> LogResult<()> {
        let frontier = self.inner.ring.write_frontier();
        self.force_to(lsn.0.saturating_add(1).min(frontier), mode)
    }

    /// Make every entry appended so far durable according to `mode`.
    pub fn force_tail(&self, mode: ForceMode) -> LogResult<()> {
        let frontier = self.inner.ring.write_frontier();
        self.force_to(frontier, mode)
    }

    fn force_to(&self, target: u64, mode: ForceMode) -> LogResult<()> {
        let inner = &self.inner;
        let soft = mode == ForceMode::Commit
            && inner.config.commit_durability == CommitDurability::Soft;
        {
            let state = inner.durability.lock();
            if state.poisoned {
                return Err(LogError::Poisoned);
            }
            let reached = if soft { state.verified } else { state.synced };
            if reached >= target {
                return Ok(());
            }
        }
        self.check_open()?;
        inner.forces.fetch_add(1, Ordering::Relaxed);

        // Recovery only trusts bytes covered by a marker, so one has to
        // follow the target before the target can count as durable.
        let mut target = target;
        let marker_end = inner.marker_end.load(Ordering::Acquire);
        if marker_end < target {
            target = self.append_marker()?;
        } else {
            target = marker_end;
        }

        let mut state = inner.durability.lock();
        loop {
            if state.poisoned {
                return Err(LogError::Poisoned);
            }
            if soft {
                if state.verified >= target {
                    return Ok(());
                }
            } else if state.synced >= target {
                return Ok(());
            }
            if state.writer_gone && state.verified < target {
                return Err(LogError::Closed);
            }
            if soft || state.syncing || state.verified < target {
                inner.durability_changed.wait(&mut state);
                continue;
            }
            self.lead_sync(&mut state, mode);
        }
    }

    /// Sync everything the log writer has verified so far on behalf of all
    /// waiting forces.
    fn lead_sync(&self, state: &mut MutexGuard<'_, Durability>, mode: ForceMode) {
        let inner = &self.inner;
        state.syncing = true;
        let window = inner.config.group_commit_window;
        if mode == ForceMode::Commit && !window.is_zero() {
            MutexGuard::unlocked(state, || thread::sleep(window));
        }
        let from = state.synced;
        let to = state.verified;
        let result = MutexGuard::unlocked(state, || inner.store.sync_range(from, to));
        state.syncing = false;
        match result {
            Ok(()) => {
                inner.syncs.fetch_add(1, Ordering::Relaxed);
                state.synced = state.synced.max(to);
                trace!("Log durable up to {}", to);
            }
            Err(e) => {
                error!("Log sync failed: {}", e);
                state.poisoned = true;
            }
        }
        inner.durability_changed.notify_all();
    }

    /// Read the entry that starts at `lsn`, waiting for it to reach its
    /// chunk file if it is still in the ring.
    pub fn read_entry(&self, lsn: Lsn) -> LogResult<LogEntry> {
        let truncation_point = self.truncation_point();
        if lsn < truncation_point {
            return Err(LogError::Truncated {
                lsn,
                truncation_point,
            });
        }
        let next = self.next_lsn();
        if lsn >= next {
            return Err(LogError::BeyondEnd { lsn, next });
        }
        if self.inner.ring.try_flush(lsn.0 + 1).is_err() {
            self.inner.ring.flush(lsn.0 + 1).map_err(|e| match e {
                RingError::Closed => LogError::Closed,
                other => other.into(),
            })?;
        }
        match self.inner.store.read_entry(lsn)? {
            Some(entry) => Ok(entry),
            None => Err(LogError::NotAnEntry(lsn)),
        }
    }

    /// The entry following `entry`, skipping chunk padding. `None` at the
    /// end of the log.
    pub fn next_entry(&self, entry: &LogEntry) -> LogResult<Option<LogEntry>> {
        self.entry_at_or_after(Lsn(entry.end()))
    }

    fn entry_at_or_after(&self, lsn: Lsn) -> LogResult<Option<LogEntry>> {
        let chunk = self.inner.config.chunk_size;
        let mut pos = lsn.0;
        loop {
            if pos >= self.inner.ring.write_frontier() {
                return Ok(None);
            }
            match self.read_entry(Lsn(pos)) {
                Ok(entry) => return Ok(Some(entry)),
                Err(LogError::NotAnEntry(_)) => pos = (pos / chunk + 1) * chunk,
                Err(e) => return Err(e),
            }
        }
    }

    /// Iterate over the entries from `from` onward, skipping internal ones.
    pub fn cursor(&self, from: Lsn) -> LogCursor<'_> {
        LogCursor {
            log: self,
            next: Some(from.max(self.truncation_point())),
        }
    }

    /// Register a collaborator whose recLSN bounds truncation.
    pub fn register_rec_lsn_source(&self, source: Arc<dyn RecLsnSource>) {
        self.inner.rec_lsn_sources.write().push(source);
    }

    /// Highest LSN the log may currently be truncated to.
    pub fn truncation_limit(&self) -> Lsn {
        let durable = self.durable_lsn();
        self.inner
            .rec_lsn_sources
            .read()
            .iter()
            .filter_map(|source| source.min_rec_lsn())
            .fold(durable, Lsn::min)
    }

    /// Drop every chunk that lies entirely below `lsn`.
    ///
    /// Fails if an entry at or after `lsn` could still be needed by a
    /// registered source, or is not durable yet.
    pub fn truncate(&self, lsn: Lsn) -> LogResult<()> {
        self.check_open()?;
        let limit = self.truncation_limit();
        if lsn > limit {
            return Err(LogError::TruncationBeyondRecLsn {
                requested: lsn,
                limit,
            });
        }
        if self.inner.store.truncate(lsn)? > 0 {
            if let Some(first) = self.inner.store.first_offset() {
                self.inner.truncation_point.fetch_max(first, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Bytes between the truncation point and the end of the log.
    pub fn size(&self) -> u64 {
        self.next_lsn().0 - self.truncation_point().0
    }

    /// Force everything, stop the log writer and wait for it.
    pub fn close(&self) -> LogResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let forced = self.force_tail(ForceMode::Wal);
        self.inner.closed.store(true, Ordering::Release);
        self.stop_writer();
        info!("Closed log at {}", self.next_lsn());
        forced
    }

    /// Stop the log writer without writing anything still in the ring.
    pub fn simulate_crash(&self) {
        self.inner.discard.store(true, Ordering::Release);
        self.inner.closed.store(true, Ordering::Release);
        self.stop_writer();
        warn!("Simulated crash; log tail after {} discarded", self.durable_lsn());
    }

    fn stop_writer(&self) {
        self.inner.ring.shutdown();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("Log writer thread panicked");
            }
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.stop_writer();
    }
}

impl LogInner {
    fn run_writer(&self) {
        debug!("Log writer started");
        loop {
            let span = match self.ring.consume_bytes(ConsumeLen::Next) {
                Ok(span) => span,
                Err(RingError::Closed) => break,
                Err(e) => {
                    error!("Log writer stopping: {}", e);
                    break;
                }
            };

            if self.discard.load(Ordering::Acquire) {
                continue;
            }
            let result = self.store.write_back(&span, span.offset());
            let end = span.end();
            drop(span);

            let mut state = self.durability.lock();
            match result {
                Ok(Some(marker_end)) => state.verified = state.verified.max(marker_end),
                Ok(None) => {}
                Err(e) => {
                    if !state.poisoned {
                        error!("Log write-back failed before {}: {}", end, e);
                    }
                    state.poisoned = true;
                }
            }
            self.durability_changed.notify_all();
        }
        let mut state = self.durability.lock();
        state.writer_gone = true;
        self.durability_changed.notify_all();
        debug!("Log writer stopped");
    }
}

/// An entry being written. See `LogManager::reserve_entry`.
pub struct EntryReservation<'a> {
    reservation: WriteReservation<'a>,
    lsn: Lsn,
    frame_at: usize,
    frame_len: usize,
    done: bool,
}

impl EntryReservation<'_> {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn frame_mut(&mut self) -> &mut [u8] {
        let end = self.frame_at + self.frame_len;
        &mut self.reservation[self.frame_at..end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        entry::payload_mut(self.frame_mut())
    }

    /// Seal the entry and hand it to the log writer.
    pub fn write_entry_done(mut self) -> Lsn {
        self.done = true;
        self.lsn
    }
}

impl Drop for EntryReservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Entry at {} abandoned; writing a no-op", self.lsn);
            entry::set_kind(self.frame_mut(), EntryKind::Noop);
        }
        entry::seal(self.frame_mut());
    }
}

/// Iterator over log entries, skipping markers and no-ops.
pub struct LogCursor<'a> {
    log: &'a LogManager,
    next: Option<Lsn>,
}

impl Iterator for LogCursor<'_> {
    type Item = LogResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let lsn = self.next.take()?;
            match self.log.entry_at_or_after(lsn) {
                Ok(Some(entry)) => {
                    self.next = Some(Lsn(entry.end()));
                    if entry.kind.is_internal() {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
