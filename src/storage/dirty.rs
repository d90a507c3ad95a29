//! Dirty page table.
//!
//! Tracks every cached page whose contents differ from its stored copy,
//! together with its recLSN: the LSN of the first update since the page was
//! last clean. Two indices are kept in step. The by-page index drives
//! opportunistic flushes in page order; the by-LSN index drives
//! truncation-priority flushes, oldest recLSN first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::storage::error::{BufferError, BufferResult};
use crate::storage::page::PageId;
use crate::storage::wal::{Lsn, RecLsnSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyTableConfig {
    /// Pages written back between two range syncs.
    pub flush_batch: usize,
    /// How long to wait for a busy page before retrying it.
    pub busy_wait: Duration,
    /// Give up on a page that stays busy this long.
    pub flush_deadline: Duration,
}

impl Default for DirtyTableConfig {
    fn default() -> Self {
        DirtyTableConfig {
            flush_batch: 64,
            busy_wait: Duration::from_millis(10),
            flush_deadline: Duration::from_secs(30),
        }
    }
}

/// Writes cached pages back on behalf of the table.
pub trait PageWriter {
    /// Write `page_id` back if it is dirty. Must not block on a latch:
    /// return `Busy` when the page is in use and `NotResident` when it is
    /// not cached.
    fn try_write_back(&self, page_id: PageId) -> BufferResult<()>;

    /// Make completed write-backs of pages in `[start, stop)` durable.
    fn force_range(&self, start: PageId, stop: PageId) -> BufferResult<()>;
}

#[derive(Default)]
struct Indices {
    by_page: BTreeMap<PageId, Lsn>,
    by_lsn: BTreeSet<(Lsn, PageId)>,
}

pub struct DirtyPageTable {
    config: DirtyTableConfig,
    indices: Mutex<Indices>,
    count: AtomicUsize,
    cleaned: Condvar,
}

impl DirtyPageTable {
    pub fn new(config: DirtyTableConfig) -> Self {
        Self {
            config,
            indices: Mutex::new(Indices::default()),
            count: AtomicUsize::new(0),
            cleaned: Condvar::new(),
        }
    }

    /// Record that `page_id` was changed by the entry at `lsn`. Only the
    /// first call after the page was clean has an effect. Returns whether
    /// the page was newly dirtied.
    pub fn set_dirty(&self, page_id: PageId, lsn: Lsn) -> bool {
        let mut indices = self.indices.lock();
        if indices.by_page.contains_key(&page_id) {
            return false;
        }
        indices.by_page.insert(page_id, lsn);
        indices.by_lsn.insert((lsn, page_id));
        self.count.fetch_add(1, Ordering::Release);
        trace!("Page {} dirty since {}", page_id, lsn);
        true
    }

    /// Record that `page_id` now matches its stored copy.
    pub fn set_clean(&self, page_id: PageId) -> bool {
        let mut indices = self.indices.lock();
        let Some(lsn) = indices.by_page.remove(&page_id) else {
            return false;
        };
        indices.by_lsn.remove(&(lsn, page_id));
        self.count.fetch_sub(1, Ordering::Release);
        drop(indices);
        self.cleaned.notify_all();
        trace!("Page {} clean", page_id);
        true
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.indices.lock().by_page.contains_key(&page_id)
    }

    /// recLSN of `page_id`, if it is dirty.
    pub fn rec_lsn(&self, page_id: PageId) -> Option<Lsn> {
        self.indices.lock().by_page.get(&page_id).copied()
    }

    /// Smallest recLSN of any dirty page.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.indices.lock().by_lsn.first().map(|(lsn, _)| *lsn)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dirty pages in page order.
    pub fn pages(&self) -> Vec<(PageId, Lsn)> {
        self.indices
            .lock()
            .by_page
            .iter()
            .map(|(page_id, lsn)| (*page_id, *lsn))
            .collect()
    }

    /// Write back every dirty page that is not in use, in page order.
    /// Busy and non-resident pages are skipped. Returns the number of pages
    /// written.
    pub fn flush_opportunistic(&self, writer: &dyn PageWriter) -> BufferResult<usize> {
        let mut written = 0;
        let mut skipped = 0;
        let mut cursor = None;
        loop {
            let batch = self.next_batch(cursor, None);
            let (Some(first), Some(last)) = (batch.first().copied(), batch.last().copied()) else {
                break;
            };
            cursor = Some(last);
            for page_id in batch {
                match writer.try_write_back(page_id) {
                    Ok(()) => written += 1,
                    Err(BufferError::Busy(_)) | Err(BufferError::NotResident(_)) => skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            writer.force_range(first, PageId(last.0 + 1))?;
        }
        debug!(
            "Opportunistic flush wrote {} page(s), skipped {}",
            written, skipped
        );
        Ok(written)
    }

    fn next_batch(&self, after: Option<PageId>, stop: Option<PageId>) -> Vec<PageId> {
        use std::ops::Bound::{Excluded, Unbounded};
        let indices = self.indices.lock();
        let lower = after.map_or(Unbounded, Excluded);
        indices
            .by_page
            .range((lower, Unbounded))
            .map(|(page_id, _)| *page_id)
            .take_while(|page_id| stop.map_or(true, |stop| *page_id < stop))
            .take(self.config.flush_batch.max(1))
            .collect()
    }

    /// Write back pages oldest recLSN first until no page dirtied before
    /// `target` remains. Busy pages are waited for; one that stays busy past
    /// the deadline fails the flush with `Stuck`.
    pub fn flush_until(&self, writer: &dyn PageWriter, target: Lsn) -> BufferResult<usize> {
        let mut written = Vec::new();
        loop {
            let next = {
                let indices = self.indices.lock();
                indices
                    .by_lsn
                    .first()
                    .copied()
                    .filter(|(lsn, _)| *lsn < target)
            };
            let Some((lsn, page_id)) = next else {
                break;
            };
            self.write_back_waiting(writer, page_id, lsn)?;
            written.push(page_id);
            if written.len() % self.config.flush_batch.max(1) == 0 {
                Self::force_written(writer, &written)?;
            }
        }
        Self::force_written(writer, &written)?;
        if !written.is_empty() {
            debug!("Flushed {} page(s) dirtied before {}", written.len(), target);
        }
        Ok(written.len())
    }

    /// Write back every dirty page in `[start, stop)`, waiting for busy ones,
    /// then sync the range.
    pub fn flush_range(
        &self,
        writer: &dyn PageWriter,
        start: PageId,
        stop: PageId,
    ) -> BufferResult<usize> {
        let mut written = 0;
        let mut cursor = if start.0 == 0 {
            None
        } else {
            Some(PageId(start.0 - 1))
        };
        loop {
            let batch = self.next_batch(cursor, Some(stop));
            let Some(last) = batch.last().copied() else {
                break;
            };
            cursor = Some(last);
            for page_id in batch {
                if let Some(lsn) = self.rec_lsn(page_id) {
                    self.write_back_waiting(writer, page_id, lsn)?;
                    written += 1;
                }
            }
        }
        writer.force_range(start, stop)?;
        Ok(written)
    }

    fn force_written(writer: &dyn PageWriter, written: &[PageId]) -> BufferResult<()> {
        let (Some(min), Some(max)) = (written.iter().min(), written.iter().max()) else {
            return Ok(());
        };
        writer.force_range(*min, PageId(max.0 + 1))
    }

    fn write_back_waiting(
        &self,
        writer: &dyn PageWriter,
        page_id: PageId,
        lsn: Lsn,
    ) -> BufferResult<()> {
        let started = Instant::now();
        let mut warned = false;
        loop {
            match writer.try_write_back(page_id) {
                Ok(()) => return Ok(()),
                Err(BufferError::Busy(_)) | Err(BufferError::NotResident(_)) => {}
                Err(e) => return Err(e),
            }
            if self.rec_lsn(page_id) != Some(lsn) {
                // Someone else cleaned it in the meantime.
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.config.flush_deadline {
                return Err(BufferError::Stuck {
                    page_id,
                    lsn,
                    waited_ms: waited.as_millis(),
                });
            }
            if !warned {
                warn!(
                    "Page {} dirty since {} is pinned; waiting for it to be released",
                    page_id, lsn
                );
                warned = true;
            }

            let mut indices = self.indices.lock();
            if indices.by_page.get(&page_id) == Some(&lsn) {
                self.cleaned.wait_for(&mut indices, self.config.busy_wait);
            }
        }
    }
}

impl RecLsnSource for DirtyPageTable {
    fn min_rec_lsn(&self) -> Option<Lsn> {
        DirtyPageTable::min_rec_lsn(self)
    }
}

impl Drop for DirtyPageTable {
    fn drop(&mut self) {
        let count = self.len();
        if count > 0 {
            warn!("Dirty page table dropped with {} dirty page(s)", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    /// Cleans pages in the table it is given, refusing the busy ones.
    struct FakeWriter {
        table: Arc<DirtyPageTable>,
        busy: Mutex<HashSet<PageId>>,
        written: Mutex<Vec<PageId>>,
        forced: Mutex<Vec<(PageId, PageId)>>,
    }

    impl FakeWriter {
        fn new(table: Arc<DirtyPageTable>) -> Self {
            Self {
                table,
                busy: Mutex::new(HashSet::new()),
                written: Mutex::new(Vec::new()),
                forced: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageWriter for FakeWriter {
        fn try_write_back(&self, page_id: PageId) -> BufferResult<()> {
            if self.busy.lock().contains(&page_id) {
                return Err(BufferError::Busy(page_id));
            }
            self.written.lock().push(page_id);
            self.table.set_clean(page_id);
            Ok(())
        }

        fn force_range(&self, start: PageId, stop: PageId) -> BufferResult<()> {
            self.forced.lock().push((start, stop));
            Ok(())
        }
    }

    fn table() -> Arc<DirtyPageTable> {
        Arc::new(DirtyPageTable::new(DirtyTableConfig {
            flush_batch: 2,
            busy_wait: Duration::from_millis(5),
            flush_deadline: Duration::from_millis(200),
        }))
    }

    #[test]
    fn test_set_dirty_is_idempotent() {
        let dpt = table();
        assert!(dpt.set_dirty(PageId(1), Lsn(10)));
        assert!(!dpt.set_dirty(PageId(1), Lsn(20)));
        assert_eq!(dpt.len(), 1);
        assert_eq!(dpt.rec_lsn(PageId(1)), Some(Lsn(10)));
        assert_eq!(dpt.indices.lock().by_lsn.len(), 1);

        assert!(dpt.set_clean(PageId(1)));
        assert!(!dpt.set_clean(PageId(1)));
        assert!(dpt.is_empty());
        assert!(dpt.set_dirty(PageId(1), Lsn(30)));
        assert_eq!(dpt.min_rec_lsn(), Some(Lsn(30)));
        dpt.set_clean(PageId(1));
    }

    #[test]
    fn test_min_rec_lsn() {
        let dpt = table();
        assert_eq!(dpt.min_rec_lsn(), None);
        dpt.set_dirty(PageId(5), Lsn(50));
        dpt.set_dirty(PageId(1), Lsn(70));
        dpt.set_dirty(PageId(9), Lsn(40));
        assert_eq!(dpt.min_rec_lsn(), Some(Lsn(40)));
        dpt.set_clean(PageId(9));
        assert_eq!(dpt.min_rec_lsn(), Some(Lsn(50)));
        for (page_id, _) in dpt.pages() {
            dpt.set_clean(page_id);
        }
    }

    #[test]
    fn test_opportunistic_skips_busy_pages() -> anyhow::Result<()> {
        let dpt = table();
        for i in 0..5 {
            dpt.set_dirty(PageId(i), Lsn(100 - i));
        }
        let writer = FakeWriter::new(Arc::clone(&dpt));
        writer.busy.lock().insert(PageId(2));

        assert_eq!(dpt.flush_opportunistic(&writer)?, 4);
        assert_eq!(
            *writer.written.lock(),
            vec![PageId(0), PageId(1), PageId(3), PageId(4)]
        );
        assert_eq!(writer.forced.lock().len(), 3);
        assert!(dpt.is_dirty(PageId(2)));
        dpt.set_clean(PageId(2));
        Ok(())
    }

    #[test]
    fn test_flush_until_goes_oldest_first() -> anyhow::Result<()> {
        let dpt = table();
        dpt.set_dirty(PageId(1), Lsn(30));
        dpt.set_dirty(PageId(2), Lsn(10));
        dpt.set_dirty(PageId(3), Lsn(20));
        dpt.set_dirty(PageId(4), Lsn(40));
        let writer = FakeWriter::new(Arc::clone(&dpt));

        assert_eq!(dpt.flush_until(&writer, Lsn(35))?, 3);
        assert_eq!(
            *writer.written.lock(),
            vec![PageId(2), PageId(3), PageId(1)]
        );
        assert_eq!(dpt.min_rec_lsn(), Some(Lsn(40)));
        assert!(!writer.forced.lock().is_empty());
        dpt.set_clean(PageId(4));
        Ok(())
    }

    #[test]
    fn test_flush_until_waits_for_busy_page() -> anyhow::Result<()> {
        let dpt = table();
        dpt.set_dirty(PageId(7), Lsn(5));
        let writer = Arc::new(FakeWriter::new(Arc::clone(&dpt)));
        writer.busy.lock().insert(PageId(7));

        let releaser = {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                writer.busy.lock().remove(&PageId(7));
            })
        };
        assert_eq!(dpt.flush_until(writer.as_ref(), Lsn(6))?, 1);
        releaser.join().unwrap();
        assert!(dpt.is_empty());
        Ok(())
    }

    #[test]
    fn test_flush_until_reports_stuck_page() {
        let dpt = table();
        dpt.set_dirty(PageId(3), Lsn(10));
        let writer = FakeWriter::new(Arc::clone(&dpt));
        writer.busy.lock().insert(PageId(3));

        let err = dpt.flush_until(&writer, Lsn(15)).unwrap_err();
        assert!(matches!(
            err,
            BufferError::Stuck {
                page_id: PageId(3),
                lsn: Lsn(10),
                ..
            }
        ));
        assert!(dpt.is_dirty(PageId(3)));
        dpt.set_clean(PageId(3));
    }

    #[test]
    fn test_flush_range() -> anyhow::Result<()> {
        let dpt = table();
        for i in 0..6 {
            dpt.set_dirty(PageId(i), Lsn(i + 1));
        }
        let writer = FakeWriter::new(Arc::clone(&dpt));
        assert_eq!(dpt.flush_range(&writer, PageId(1), PageId(4))?, 3);
        assert_eq!(
            dpt.pages().into_iter().map(|(p, _)| p).collect::<Vec<_>>(),
            vec![PageId(0), PageId(4), PageId(5)]
        );
        assert_eq!(writer.forced.lock().last(), Some(&(PageId(1), PageId(4))));
        for (page_id, _) in dpt.pages() {
            dpt.set_clean(page_id);
        }
        Ok(())
    }
}
