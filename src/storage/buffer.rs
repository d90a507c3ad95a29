pub mod lru;
pub mod replacer;

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use replacer::{FrameId, Replacer};
use serde::{Deserialize, Serialize};

use crate::storage::dirty::{DirtyPageTable, PageWriter};
use crate::storage::error::{BufferError, BufferResult};
use crate::storage::handle::PageHandle;
use crate::storage::page::{Page, PageId, PageType, PAGE_SIZE};
use crate::storage::wal::{ForceMode, LogManager, Lsn, Xid};

const INVALID_PAGE: u64 = u64::MAX;

/// Pin count of a frame that is being handed to another page.
const EVICTING: u32 = u32::MAX;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Pages pinned by guards living on this thread, tagged by pool.
    static PIN_LEDGER: RefCell<Vec<(usize, PageId)>> = const { RefCell::new(Vec::new()) };
}

fn ledger_add(pool: usize, page_id: PageId) {
    PIN_LEDGER.with(|ledger| ledger.borrow_mut().push((pool, page_id)));
}

fn ledger_remove(pool: usize, page_id: PageId) {
    PIN_LEDGER.with(|ledger| {
        let mut ledger = ledger.borrow_mut();
        if let Some(pos) = ledger.iter().rposition(|e| *e == (pool, page_id)) {
            ledger.swap_remove(pos);
        }
    });
}

fn ledger_holds(pool: usize, page_id: PageId) -> bool {
    PIN_LEDGER.with(|ledger| ledger.borrow().contains(&(pool, page_id)))
}

fn ledger_any(pool: usize) -> Option<PageId> {
    PIN_LEDGER.with(|ledger| {
        ledger
            .borrow()
            .iter()
            .find(|(p, _)| *p == pool)
            .map(|(_, page_id)| *page_id)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of page frames.
    pub capacity: usize,
    pub page_size: usize,
    /// The write-back worker starts flushing once more pages than this are
    /// dirty.
    pub write_back_threshold: usize,
    /// Failed attempts to find a victim before the slow path is logged.
    pub eviction_retry_budget: u32,
    /// How long waiters and the write-back worker sleep between checks.
    pub idle_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            capacity: 1024,
            page_size: PAGE_SIZE,
            write_back_threshold: 256,
            eviction_retry_budget: 100,
            idle_interval: Duration::from_millis(100),
        }
    }
}

struct FrameData {
    page: Page,
    dirty: bool,
}

struct Frame {
    page_id: AtomicU64,
    pin_count: AtomicU32,
    /// Asked to write back while pinned; retried on release.
    needs_flush: AtomicBool,
    latch: RwLock<FrameData>,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            page_id: AtomicU64::new(INVALID_PAGE),
            pin_count: AtomicU32::new(0),
            needs_flush: AtomicBool::new(false),
            latch: RwLock::new(FrameData {
                page: Page::new(PageId(INVALID_PAGE), PageType::UNINITIALIZED, page_size),
                dirty: false,
            }),
        }
    }

    fn holds(&self, page_id: PageId) -> bool {
        self.page_id.load(Ordering::Acquire) == page_id.0
    }
}

enum Lookup {
    Hit(FrameId),
    Miss,
    /// Mapped, but the frame is changing hands.
    Evicting,
}

#[derive(Default)]
struct WorkerState {
    queue: Vec<PageId>,
    shutdown: bool,
}

struct BufferInner {
    id: usize,
    config: BufferConfig,
    frames: Vec<Frame>,
    page_table: DashMap<PageId, FrameId>,
    replacer: Mutex<Box<dyn Replacer>>,
    frame_freed: Condvar,
    handle: Box<dyn PageHandle>,
    log: Arc<LogManager>,
    dirty: Arc<DirtyPageTable>,
    worker: Mutex<WorkerState>,
    work_ready: Condvar,
    closed: AtomicBool,
}

pub struct BufferManager {
    inner: Arc<BufferInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferManager {
    pub fn new(
        config: BufferConfig,
        handle: Box<dyn PageHandle>,
        log: Arc<LogManager>,
        dirty: Arc<DirtyPageTable>,
    ) -> BufferResult<Self> {
        let capacity = config.capacity.max(1);
        let frames = (0..capacity)
            .map(|_| Frame::new(config.page_size))
            .collect::<Vec<_>>();
        let mut replacer: Box<dyn Replacer> = Box::new(lru::LruReplacer::new(capacity));
        for frame_id in 0..capacity {
            replacer.release(frame_id as FrameId);
        }

        let inner = Arc::new(BufferInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            frames,
            page_table: DashMap::with_capacity(capacity),
            replacer: Mutex::new(replacer),
            frame_freed: Condvar::new(),
            handle,
            log,
            dirty,
            worker: Mutex::new(WorkerState::default()),
            work_ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("buffer-write-back".to_string())
            .spawn(move || worker.run_write_back())?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    pub fn dirty_pages(&self) -> &Arc<DirtyPageTable> {
        &self.inner.dirty
    }

    /// Number of frames currently holding a page.
    pub fn resident_count(&self) -> usize {
        self.inner.page_table.len()
    }

    /// Pinned, read-latched page if it is cached and not being written
    /// back. Never blocks.
    pub fn get_cached_page(&self, page_id: PageId) -> Option<PageReadGuard<'_>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let Lookup::Hit(frame_id) = self.inner.lookup_and_pin(page_id) else {
            return None;
        };
        let frame = self.inner.frame(frame_id);
        let Some(latch) = frame.latch.try_read() else {
            self.inner.unpin(frame_id);
            return None;
        };
        if !frame.holds(page_id) {
            drop(latch);
            self.inner.unpin(frame_id);
            return None;
        }
        Some(PageReadGuard::new(&self.inner, frame_id, page_id, latch))
    }

    /// Pin and read-latch `page_id`, reading it through the page handle on
    /// a miss.
    pub fn load_page(
        &self,
        xid: Xid,
        page_id: PageId,
        page_type: PageType,
    ) -> BufferResult<PageReadGuard<'_>> {
        loop {
            let frame_id = self.inner.fetch(xid, page_id, page_type, true)?;
            let frame = self.inner.frame(frame_id);
            let latch = frame.latch.read();
            if frame.holds(page_id) {
                return Ok(PageReadGuard::new(&self.inner, frame_id, page_id, latch));
            }
            drop(latch);
            self.inner.unpin(frame_id);
        }
    }

    /// Like `load_page`, but with the write latch.
    pub fn load_page_mut(
        &self,
        xid: Xid,
        page_id: PageId,
        page_type: PageType,
    ) -> BufferResult<PageWriteGuard<'_>> {
        self.load_write(xid, page_id, page_type, true)
    }

    /// Write-latch `page_id` without reading its stored image on a miss.
    /// For pages about to be formatted from scratch.
    pub fn load_uninit_page(
        &self,
        xid: Xid,
        page_id: PageId,
        page_type: PageType,
    ) -> BufferResult<PageWriteGuard<'_>> {
        self.load_write(xid, page_id, page_type, false)
    }

    fn load_write(
        &self,
        xid: Xid,
        page_id: PageId,
        page_type: PageType,
        read: bool,
    ) -> BufferResult<PageWriteGuard<'_>> {
        loop {
            let frame_id = self.inner.fetch(xid, page_id, page_type, read)?;
            let frame = self.inner.frame(frame_id);
            let latch = frame.latch.write();
            if frame.holds(page_id) {
                return Ok(PageWriteGuard::new(&self.inner, frame_id, page_id, latch));
            }
            drop(latch);
            self.inner.unpin(frame_id);
        }
    }

    /// Write `page_id` back if it is dirty, waiting for its latch.
    ///
    /// Fails with `PinnedByCaller` if this thread holds a guard on the page,
    /// since waiting for the latch would never finish.
    pub fn write_back_page(&self, page_id: PageId) -> BufferResult<()> {
        if ledger_holds(self.inner.id, page_id) {
            return Err(BufferError::PinnedByCaller(page_id));
        }
        let frame_id = match self.inner.lookup_and_pin(page_id) {
            Lookup::Hit(frame_id) => frame_id,
            // Eviction writes the page back on its way out.
            Lookup::Evicting | Lookup::Miss => return Err(BufferError::NotResident(page_id)),
        };
        let frame = self.inner.frame(frame_id);
        let mut latch = frame.latch.write();
        let result = if frame.holds(page_id) {
            self.inner.write_back_locked(frame, &mut latch)
        } else {
            Err(BufferError::NotResident(page_id))
        };
        drop(latch);
        self.inner.unpin(frame_id);
        result
    }

    /// Write `page_id` back if it is dirty and nobody holds its latch.
    ///
    /// A busy page is flagged and written back by the worker once released.
    pub fn try_to_write_back_page(&self, page_id: PageId) -> BufferResult<()> {
        self.inner.try_write_back(page_id)
    }

    /// Write back every dirty page that is not in use.
    pub fn flush_opportunistic(&self) -> BufferResult<usize> {
        self.inner.dirty.flush_opportunistic(self.inner.as_ref())
    }

    /// Write back every page dirtied before `target`, oldest first, waiting
    /// for pages other threads hold.
    ///
    /// Fails with `PinnedByCaller` if this thread holds any guard from this
    /// pool, since such a page could never be written.
    pub fn flush_until(&self, target: Lsn) -> BufferResult<usize> {
        if let Some(page_id) = ledger_any(self.inner.id) {
            return Err(BufferError::PinnedByCaller(page_id));
        }
        self.inner.dirty.flush_until(self.inner.as_ref(), target)
    }

    /// Write back the dirty pages in `[start, stop)` and sync them.
    pub fn flush_range(&self, start: PageId, stop: PageId) -> BufferResult<usize> {
        if let Some(page_id) = ledger_any(self.inner.id) {
            if page_id >= start && page_id < stop {
                return Err(BufferError::PinnedByCaller(page_id));
            }
        }
        self.inner.dirty.flush_range(self.inner.as_ref(), start, stop)
    }

    /// Make every completed write-back durable.
    pub fn force_pages(&self) -> BufferResult<()> {
        self.inner.handle.force_file()?;
        Ok(())
    }

    /// Make completed write-backs of pages in `[start, stop)` durable.
    pub fn force_page_range(&self, start: PageId, stop: PageId) -> BufferResult<()> {
        self.inner.handle.force_range(start, stop)?;
        Ok(())
    }

    /// Write back every dirty page, sync the page store and stop the
    /// write-back worker.
    pub fn close(&self) -> BufferResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stop_worker();
        let flushed = self.flush_until(Lsn::MAX);
        self.inner.closed.store(true, Ordering::Release);
        flushed?;
        self.inner.handle.force_file()?;
        let left = self.inner.dirty.len();
        if left > 0 {
            warn!("Buffer manager closed with {} unwritten dirty page(s)", left);
        }
        info!("Closed buffer manager");
        Ok(())
    }

    /// Stop the write-back worker and refuse further loads. Nothing is
    /// written back.
    pub fn simulate_crash(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.stop_worker();
        self.inner.frame_freed.notify_all();
        warn!(
            "Simulated crash; {} dirty page(s) dropped",
            self.inner.dirty.len()
        );
    }

    fn stop_worker(&self) {
        {
            let mut state = self.inner.worker.lock();
            state.shutdown = true;
            self.inner.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Buffer write-back worker panicked");
            }
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl BufferInner {
    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id as usize]
    }

    fn check_open(&self) -> BufferResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        Ok(())
    }

    /// Add a pin unless the frame is being evicted.
    fn pin(&self, frame_id: FrameId) -> bool {
        let frame = self.frame(frame_id);
        let mut current = frame.pin_count.load(Ordering::Acquire);
        loop {
            if current == EVICTING {
                return false;
            }
            match frame.pin_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 0 {
            self.replacer.lock().hold(frame_id);
        }
        true
    }

    fn unpin(&self, frame_id: FrameId) {
        let frame = self.frame(frame_id);
        let previous = frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0 && previous != EVICTING);
        if previous == 1 {
            let mut replacer = self.replacer.lock();
            // Someone may have pinned it again since.
            if frame.pin_count.load(Ordering::Acquire) == 0 {
                replacer.release(frame_id);
                self.frame_freed.notify_all();
            }
        }
    }

    fn lookup_and_pin(&self, page_id: PageId) -> Lookup {
        // Pin while the shard is still locked so the mapping cannot be
        // removed in between.
        let Some(entry) = self.page_table.get(&page_id) else {
            return Lookup::Miss;
        };
        let frame_id = *entry.value();
        if self.pin(frame_id) {
            Lookup::Hit(frame_id)
        } else {
            Lookup::Evicting
        }
    }

    /// Pinned frame for `page_id`, loading it if needed. The caller still
    /// has to latch it and check that it holds the page.
    fn fetch(&self, xid: Xid, page_id: PageId, page_type: PageType, read: bool) -> BufferResult<FrameId> {
        loop {
            self.check_open()?;
            match self.lookup_and_pin(page_id) {
                Lookup::Hit(frame_id) => {
                    trace!("xid {}: page {} hit in frame {}", xid, page_id, frame_id);
                    return Ok(frame_id);
                }
                Lookup::Evicting => {
                    thread::yield_now();
                    continue;
                }
                Lookup::Miss => {}
            }
            let victim = self.acquire_victim()?;
            if self.install(victim, page_id, page_type, read)? {
                trace!("xid {}: page {} loaded into frame {}", xid, page_id, victim);
                return Ok(victim);
            }
        }
    }

    /// Claim an unpinned frame, waiting for one to be released if needed.
    fn acquire_victim(&self) -> BufferResult<FrameId> {
        let mut attempts = 0u32;
        let mut replacer = self.replacer.lock();
        loop {
            while let Some(victim) = replacer.take_victim() {
                let claimed = self.frame(victim).pin_count.compare_exchange(
                    0,
                    EVICTING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if claimed.is_ok() {
                    return Ok(victim);
                }
            }
            self.check_open()?;

            attempts += 1;
            if attempts == self.config.eviction_retry_budget {
                warn!(
                    "No evictable frame after {} attempts; waiting for pages to be released",
                    attempts
                );
            }
            MutexGuard::unlocked(&mut replacer, || self.nudge_worker());
            self.frame_freed
                .wait_for(&mut replacer, self.config.idle_interval);
        }
    }

    /// Give a claimed frame to `page_id`. Returns false if another thread
    /// mapped the page first, in which case the frame is released.
    fn install(&self, victim: FrameId, page_id: PageId, page_type: PageType, read: bool) -> BufferResult<bool> {
        let frame = self.frame(victim);
        let mut latch = frame.latch.write();

        let old = frame.page_id.load(Ordering::Acquire);
        if old != INVALID_PAGE {
            if let Err(e) = self.write_back_locked(frame, &mut latch) {
                frame.pin_count.store(0, Ordering::Release);
                drop(latch);
                self.replacer.lock().release(victim);
                self.frame_freed.notify_all();
                return Err(e);
            }
            self.page_table.remove_if(&PageId(old), |_, f| *f == victim);
            frame.page_id.store(INVALID_PAGE, Ordering::Release);
            trace!("Evicted page {} from frame {}", PageId(old), victim);
        }

        match self.page_table.entry(page_id) {
            Entry::Occupied(_) => {
                frame.pin_count.store(0, Ordering::Release);
                drop(latch);
                self.replacer.lock().release(victim);
                self.frame_freed.notify_all();
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                frame.page_id.store(page_id.0, Ordering::Release);
                frame.pin_count.store(1, Ordering::Release);
                slot.insert(victim);
            }
        }

        latch.page.reset(page_id, page_type);
        latch.dirty = false;
        frame.needs_flush.store(false, Ordering::Release);
        if read {
            if let Err(e) = self.handle.read(&mut latch.page) {
                error!("Failed to read page {}: {}", page_id, e);
                self.page_table.remove_if(&page_id, |_, f| *f == victim);
                frame.page_id.store(INVALID_PAGE, Ordering::Release);
                drop(latch);
                self.unpin(victim);
                return Err(e.into());
            }
        }
        Ok(true)
    }

    /// Write a latched frame back if it is dirty. The log is forced up to
    /// the page's LSN first.
    fn write_back_locked(&self, frame: &Frame, data: &mut FrameData) -> BufferResult<()> {
        if !data.dirty {
            frame.needs_flush.store(false, Ordering::Release);
            return Ok(());
        }
        let page_id = data.page.id();
        self.log.force(data.page.lsn(), ForceMode::Wal)?;
        self.handle.write(&data.page)?;
        data.dirty = false;
        frame.needs_flush.store(false, Ordering::Release);
        self.dirty.set_clean(page_id);
        trace!("Wrote back page {} at {}", page_id, data.page.lsn());
        Ok(())
    }

    fn try_write_back(&self, page_id: PageId) -> BufferResult<()> {
        let frame_id = match self.lookup_and_pin(page_id) {
            Lookup::Hit(frame_id) => frame_id,
            Lookup::Evicting => return Err(BufferError::Busy(page_id)),
            Lookup::Miss => return Err(BufferError::NotResident(page_id)),
        };
        let frame = self.frame(frame_id);
        let Some(mut latch) = frame.latch.try_write() else {
            frame.needs_flush.store(true, Ordering::Release);
            self.unpin(frame_id);
            return Err(BufferError::Busy(page_id));
        };
        let result = if frame.holds(page_id) {
            self.write_back_locked(frame, &mut latch)
        } else {
            Err(BufferError::NotResident(page_id))
        };
        drop(latch);
        self.unpin(frame_id);
        result
    }

    fn schedule_write_back(&self, page_id: PageId) {
        let mut state = self.worker.lock();
        if !state.queue.contains(&page_id) {
            state.queue.push(page_id);
        }
        self.work_ready.notify_one();
    }

    fn nudge_worker(&self) {
        let _state = self.worker.lock();
        self.work_ready.notify_one();
    }

    fn run_write_back(&self) {
        debug!("Buffer write-back worker started");
        loop {
            let queued = {
                let mut state = self.worker.lock();
                if state.queue.is_empty()
                    && !state.shutdown
                    && self.dirty.len() <= self.config.write_back_threshold
                {
                    self.work_ready
                        .wait_for(&mut state, self.config.idle_interval);
                }
                if state.shutdown {
                    break;
                }
                std::mem::take(&mut state.queue)
            };

            for page_id in queued {
                match self.try_write_back(page_id) {
                    Ok(()) | Err(BufferError::Busy(_)) | Err(BufferError::NotResident(_)) => {}
                    Err(e) => error!("Write-back of page {} failed: {}", page_id, e),
                }
            }
            if self.dirty.len() > self.config.write_back_threshold {
                if let Err(e) = self.dirty.flush_opportunistic(self) {
                    error!("Background flush failed: {}", e);
                    thread::sleep(self.config.idle_interval);
                }
            }
        }
        debug!("Buffer write-back worker stopped");
    }
}

impl PageWriter for BufferInner {
    fn try_write_back(&self, page_id: PageId) -> BufferResult<()> {
        BufferInner::try_write_back(self, page_id)
    }

    fn force_range(&self, start: PageId, stop: PageId) -> BufferResult<()> {
        self.handle.force_range(start, stop)?;
        Ok(())
    }
}

/// Releases the pin when dropped.
struct Pin<'a> {
    inner: &'a BufferInner,
    frame_id: FrameId,
    page_id: PageId,
}

impl<'a> Pin<'a> {
    fn new(inner: &'a BufferInner, frame_id: FrameId, page_id: PageId) -> Self {
        ledger_add(inner.id, page_id);
        Self {
            inner,
            frame_id,
            page_id,
        }
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        ledger_remove(self.inner.id, self.page_id);
        let frame = self.inner.frame(self.frame_id);
        let needs_flush = frame.needs_flush.load(Ordering::Acquire);
        self.inner.unpin(self.frame_id);
        if needs_flush {
            self.inner.schedule_write_back(self.page_id);
        }
    }
}

/// A pinned page under a shared latch.
pub struct PageReadGuard<'a> {
    // Field order matters: the latch is released before the pin.
    latch: RwLockReadGuard<'a, FrameData>,
    pin: Pin<'a>,
}

impl<'a> PageReadGuard<'a> {
    fn new(
        inner: &'a BufferInner,
        frame_id: FrameId,
        page_id: PageId,
        latch: RwLockReadGuard<'a, FrameData>,
    ) -> Self {
        Self {
            latch,
            pin: Pin::new(inner, frame_id, page_id),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn is_dirty(&self) -> bool {
        self.latch.dirty
    }

    /// Unlatch and unpin.
    pub fn release(self) {}
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.latch.page
    }
}

/// A pinned page under an exclusive latch.
///
/// Changes are only written back if `mark_dirty` is called.
pub struct PageWriteGuard<'a> {
    // Field order matters: the latch is released before the pin.
    latch: RwLockWriteGuard<'a, FrameData>,
    pin: Pin<'a>,
}

impl<'a> PageWriteGuard<'a> {
    fn new(
        inner: &'a BufferInner,
        frame_id: FrameId,
        page_id: PageId,
        latch: RwLockWriteGuard<'a, FrameData>,
    ) -> Self {
        Self {
            latch,
            pin: Pin::new(inner, frame_id, page_id),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn is_dirty(&self) -> bool {
        self.latch.dirty
    }

    /// Stamp the page with the LSN of the entry describing the change just
    /// made and record it in the dirty page table.
    pub fn mark_dirty(&mut self, lsn: Lsn) {
        self.latch.page.set_lsn(lsn);
        self.latch.dirty = true;
        self.pin.inner.dirty.set_dirty(self.pin.page_id, lsn);
    }

    /// Unlatch and unpin.
    pub fn release(self) {}
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.latch.page
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.latch.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dirty::DirtyTableConfig;
    use crate::storage::handle::MemoryPageHandle;
    use crate::storage::wal::{EntryHeader, EntryKind, LogConfig};
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        log: Arc<LogManager>,
        store: MemoryPageHandle,
        pool: BufferManager,
    }

    fn fixture(capacity: usize) -> Result<Fixture> {
        let dir = tempdir()?;
        let log = Arc::new(LogManager::open(LogConfig {
            log_dir: dir.path().join("log"),
            ring_capacity_bits: 16,
            chunk_size: 8192,
            ..Default::default()
        })?);
        let dirty = Arc::new(DirtyPageTable::new(DirtyTableConfig {
            busy_wait: Duration::from_millis(5),
            flush_deadline: Duration::from_millis(500),
            ..Default::default()
        }));
        let store = MemoryPageHandle::new();
        let pool = BufferManager::new(
            BufferConfig {
                capacity,
                page_size: 256,
                idle_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Box::new(store.clone()),
            Arc::clone(&log),
            dirty,
        )?;
        Ok(Fixture {
            _dir: dir,
            log,
            store,
            pool,
        })
    }

    fn update(f: &Fixture, page_id: PageId, byte: u8) -> Result<Lsn> {
        let lsn = f.log.append(
            EntryHeader::new(EntryKind::Update, 1).with_page(page_id),
            &[byte],
        )?;
        let mut page = f.pool.load_page_mut(1, page_id, PageType(1))?;
        page.data_mut()[0] = byte;
        page.mark_dirty(lsn);
        Ok(lsn)
    }

    #[test]
    fn test_load_and_cache() -> Result<()> {
        let f = fixture(4)?;
        assert!(f.pool.get_cached_page(PageId(1)).is_none());

        update(&f, PageId(1), 42)?;
        let page = f.pool.get_cached_page(PageId(1)).expect("cached");
        assert_eq!(page.data()[0], 42);
        assert!(page.is_dirty());
        assert_eq!(page.page_type(), PageType(1));
        drop(page);

        let page = f.pool.load_page(1, PageId(1), PageType(1))?;
        assert_eq!(page.data()[0], 42);
        assert_eq!(f.pool.resident_count(), 1);
        Ok(())
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() -> Result<()> {
        let f = fixture(2)?;
        let lsn = update(&f, PageId(1), 7)?;
        update(&f, PageId(2), 8)?;
        // Evicts page 1.
        update(&f, PageId(3), 9)?;

        assert_eq!(f.store.stored_lsn(PageId(1)), Some(lsn));
        assert!(f.log.durable_lsn() > lsn);
        assert!(!f.pool.dirty_pages().is_dirty(PageId(1)));

        let page = f.pool.load_page(1, PageId(1), PageType(1))?;
        assert_eq!(page.data()[0], 7);
        assert_eq!(page.lsn(), lsn);
        Ok(())
    }

    #[test]
    fn test_cached_lookup_fails_while_write_latched() -> Result<()> {
        let f = fixture(4)?;
        let guard = f.pool.load_page_mut(1, PageId(5), PageType(1))?;
        let missed = thread::scope(|s| s.spawn(|| f.pool.get_cached_page(PageId(5)).is_none()).join());
        assert!(missed.unwrap());
        drop(guard);
        assert!(f.pool.get_cached_page(PageId(5)).is_some());
        Ok(())
    }

    #[test]
    fn test_try_write_back_busy_and_not_resident() -> Result<()> {
        let f = fixture(4)?;
        update(&f, PageId(1), 1)?;
        assert!(matches!(
            f.pool.try_to_write_back_page(PageId(9)),
            Err(BufferError::NotResident(PageId(9)))
        ));

        let guard = f.pool.load_page(1, PageId(1), PageType(1))?;
        assert!(matches!(
            f.pool.try_to_write_back_page(PageId(1)),
            Err(BufferError::Busy(PageId(1)))
        ));
        assert!(matches!(
            f.pool.write_back_page(PageId(1)),
            Err(BufferError::PinnedByCaller(PageId(1)))
        ));
        drop(guard);

        f.pool.write_back_page(PageId(1))?;
        assert!(f.store.stored_lsn(PageId(1)).is_some());
        assert!(f.pool.dirty_pages().is_empty());
        Ok(())
    }

    #[test]
    fn test_release_schedules_flagged_write_back() -> Result<()> {
        let f = fixture(4)?;
        update(&f, PageId(3), 3)?;
        let guard = f.pool.load_page(1, PageId(3), PageType(1))?;
        assert!(f.pool.try_to_write_back_page(PageId(3)).is_err());
        drop(guard);

        for _ in 0..200 {
            if f.store.stored_lsn(PageId(3)).is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(f.store.stored_lsn(PageId(3)).is_some());
        Ok(())
    }

    #[test]
    fn test_strict_flush_rejects_own_pins() -> Result<()> {
        let f = fixture(4)?;
        update(&f, PageId(1), 1)?;
        update(&f, PageId(2), 2)?;

        let guard = f.pool.load_page(1, PageId(2), PageType(1))?;
        assert!(matches!(
            f.pool.flush_until(Lsn::MAX),
            Err(BufferError::PinnedByCaller(PageId(2)))
        ));
        // The opportunistic flush skips the pinned page instead.
        assert_eq!(f.pool.flush_opportunistic()?, 1);
        drop(guard);

        // Releasing the page may already have queued it for the worker.
        f.pool.flush_until(Lsn::MAX)?;
        assert!(f.pool.dirty_pages().is_empty());
        Ok(())
    }

    #[test]
    fn test_uninit_page_skips_read() -> Result<()> {
        let f = fixture(2)?;
        update(&f, PageId(4), 4)?;
        f.pool.write_back_page(PageId(4))?;
        update(&f, PageId(5), 5)?;
        update(&f, PageId(6), 6)?;

        let page = f.pool.load_uninit_page(1, PageId(4), PageType(2))?;
        assert_eq!(page.data()[0], 0);
        assert_eq!(page.page_type(), PageType(2));
        Ok(())
    }

    #[test]
    fn test_close_flushes_everything() -> Result<()> {
        let f = fixture(8)?;
        for i in 0..5 {
            update(&f, PageId(i), i as u8)?;
        }
        f.pool.close()?;
        assert_eq!(f.store.len(), 5);
        assert!(f.pool.dirty_pages().is_empty());
        assert!(matches!(
            f.pool.load_page(1, PageId(0), PageType(1)),
            Err(BufferError::Closed)
        ));
        Ok(())
    }

    #[test]
    fn test_simulate_crash_drops_dirty_pages() -> Result<()> {
        let f = fixture(8)?;
        update(&f, PageId(1), 1)?;
        f.pool.simulate_crash();
        assert!(f.store.is_empty());
        assert!(f.pool.get_cached_page(PageId(1)).is_none());
        f.pool.dirty_pages().set_clean(PageId(1));
        Ok(())
    }

    #[test]
    fn test_concurrent_readers_and_writers() -> Result<()> {
        let f = fixture(4)?;
        thread::scope(|s| {
            for t in 0..4u64 {
                let f = &f;
                s.spawn(move || {
                    for i in 0..50u64 {
                        let page_id = PageId((t * 7 + i) % 10);
                        if i % 3 == 0 {
                            update(f, page_id, i as u8).unwrap();
                        } else {
                            let page = f.pool.load_page(t, page_id, PageType(1)).unwrap();
                            assert_eq!(page.id(), page_id);
                        }
                    }
                });
            }
        });
        f.pool.close()?;
        assert!(f.pool.dirty_pages().is_empty());
        Ok(())
    }
}
