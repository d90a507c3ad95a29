//! The storage runtime: one explicitly owned context holding the log, the
//! dirty page table, the buffer manager and the transaction table.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::recovery::{ActiveTransactions, TruncationConfig, Truncator};
use crate::storage::buffer::{BufferConfig, BufferManager, PageWriteGuard};
use crate::storage::dirty::{DirtyPageTable, DirtyTableConfig};
use crate::storage::error::StorageResult;
use crate::storage::handle::PageHandle;
use crate::storage::page::Page;
use crate::storage::wal::{EntryHeader, EntryKind, ForceMode, LogConfig, LogManager, Lsn, Xid};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub log: LogConfig,
    pub buffer: BufferConfig,
    pub dirty_pages: DirtyTableConfig,
    /// Enables the background truncation worker.
    pub truncation: Option<TruncationConfig>,
}

pub struct Runtime {
    log: Arc<LogManager>,
    dirty: Arc<DirtyPageTable>,
    pool: Arc<BufferManager>,
    transactions: Arc<ActiveTransactions>,
    truncator: Arc<Truncator>,
    truncation_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Open the log, then build the buffer manager on top of `handle`.
    pub fn open(config: RuntimeConfig, handle: Box<dyn PageHandle>) -> StorageResult<Self> {
        let log = Arc::new(LogManager::open(config.log)?);
        let dirty = Arc::new(DirtyPageTable::new(config.dirty_pages));
        let transactions = Arc::new(ActiveTransactions::new());
        log.register_rec_lsn_source(dirty.clone());
        log.register_rec_lsn_source(transactions.clone());

        let pool = Arc::new(BufferManager::new(
            config.buffer,
            handle,
            Arc::clone(&log),
            Arc::clone(&dirty),
        )?);

        let background = config.truncation.is_some();
        let truncator = Arc::new(Truncator::new(
            config.truncation.unwrap_or_default(),
            Arc::clone(&log),
            Arc::clone(&pool),
            Arc::clone(&transactions),
        ));
        let truncation_worker = if background {
            Some(truncator.spawn_worker()?)
        } else {
            None
        };

        info!("Storage runtime open; log continues at {}", log.next_lsn());
        Ok(Self {
            log,
            dirty,
            pool,
            transactions,
            truncator,
            truncation_worker: Mutex::new(truncation_worker),
        })
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn pool(&self) -> &BufferManager {
        &self.pool
    }

    pub fn dirty_pages(&self) -> &DirtyPageTable {
        &self.dirty
    }

    pub fn transactions(&self) -> &ActiveTransactions {
        &self.transactions
    }

    pub fn begin(&self) -> Xid {
        self.transactions.begin()
    }

    /// Log an update of the latched page, apply it with `apply`, then stamp
    /// the page with the entry's LSN and mark it dirty.
    pub fn log_update<F>(
        &self,
        xid: Xid,
        page: &mut PageWriteGuard<'_>,
        payload: &[u8],
        apply: F,
    ) -> StorageResult<Lsn>
    where
        F: FnOnce(&mut Page),
    {
        self.transactions.reserve_rec_lsn(xid, self.log.next_lsn());
        let header = EntryHeader::new(EntryKind::Update, xid)
            .with_prev_lsn(self.transactions.last_lsn(xid))
            .with_page(page.page_id());
        let lsn = self.log.append(header, payload)?;
        apply(page);
        page.mark_dirty(lsn);
        self.transactions.record(xid, lsn);
        Ok(lsn)
    }

    fn log_outcome(&self, xid: Xid, kind: EntryKind) -> StorageResult<Lsn> {
        let header =
            EntryHeader::new(kind, xid).with_prev_lsn(self.transactions.last_lsn(xid));
        let lsn = self.log.append(header, &[])?;
        self.transactions.record(xid, lsn);
        Ok(lsn)
    }

    /// Log the commit and wait until it is as durable as the log's commit
    /// durability setting requires.
    pub fn commit(&self, xid: Xid) -> StorageResult<Lsn> {
        let lsn = self.log_outcome(xid, EntryKind::Commit)?;
        self.log.force(lsn, ForceMode::Commit)?;
        self.transactions.finish(xid);
        Ok(lsn)
    }

    /// Log that `xid` is aborting. Its entries stay needed until `end`.
    pub fn abort(&self, xid: Xid) -> StorageResult<Lsn> {
        self.log_outcome(xid, EntryKind::Abort)
    }

    /// Log the end of an aborted transaction and forget it.
    pub fn end(&self, xid: Xid) -> StorageResult<Lsn> {
        let lsn = self.log_outcome(xid, EntryKind::End)?;
        self.transactions.finish(xid);
        Ok(lsn)
    }

    /// See `Truncator::truncate_now`.
    pub fn truncate_now(&self, force: bool) -> StorageResult<bool> {
        self.truncator.truncate_now(force)
    }

    fn stop_truncation(&self) {
        self.truncator.stop();
        if let Some(handle) = self.truncation_worker.lock().take() {
            if handle.join().is_err() {
                error!("Truncation worker panicked");
            }
        }
    }

    /// Write back every dirty page, force the log and stop all workers.
    pub fn close(&self) -> StorageResult<()> {
        self.stop_truncation();
        let pages = self.pool.close();
        let log = self.log.close();
        pages?;
        log?;
        if !self.transactions.is_empty() {
            info!(
                "Closed with {} transaction(s) still active",
                self.transactions.len()
            );
        }
        Ok(())
    }

    /// Stop every worker without writing anything back, as if the process
    /// died. Reopening the same log and page store afterwards shows what
    /// survived.
    pub fn simulate_crash(&self) {
        self.stop_truncation();
        self.pool.simulate_crash();
        self.log.simulate_crash();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop_truncation();
    }
}

