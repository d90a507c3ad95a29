use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tempfile::tempdir;
use vibecore::storage::wal::{EntryHeader, EntryKind, LogConfig, LogManager, Lsn};
use vibecore::storage::{
    BufferConfig, BufferError, BufferManager, DirtyPageTable, DirtyTableConfig,
    MemoryPageHandle, Page, PageHandle, PageId, PageType,
};

const DATA: PageType = PageType(1);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Page store that checks every write against the durable end of the log.
struct WalCheckingHandle {
    inner: MemoryPageHandle,
    log: Arc<LogManager>,
    writes: Arc<AtomicUsize>,
    violations: Arc<AtomicUsize>,
}

impl PageHandle for WalCheckingHandle {
    fn read(&self, page: &mut Page) -> io::Result<()> {
        self.inner.read(page)
    }

    fn write(&self, page: &Page) -> io::Result<()> {
        if self.log.durable_lsn() <= page.lsn() {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(page)
    }

    fn force_file(&self) -> io::Result<()> {
        self.inner.force_file()
    }

    fn force_range(&self, start: PageId, stop: PageId) -> io::Result<()> {
        self.inner.force_range(start, stop)
    }

    fn dup(&self) -> io::Result<Box<dyn PageHandle>> {
        Ok(Box::new(WalCheckingHandle {
            inner: self.inner.clone(),
            log: Arc::clone(&self.log),
            writes: Arc::clone(&self.writes),
            violations: Arc::clone(&self.violations),
        }))
    }
}

fn open_log(dir: &Path) -> Result<Arc<LogManager>> {
    Ok(Arc::new(LogManager::open(LogConfig {
        log_dir: dir.to_path_buf(),
        ring_capacity_bits: 16,
        chunk_size: 8192,
        ..Default::default()
    })?))
}

fn pool_config(capacity: usize) -> BufferConfig {
    BufferConfig {
        capacity,
        page_size: 256,
        write_back_threshold: 2,
        idle_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

#[test]
fn test_pages_are_never_written_ahead_of_the_log() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let log = open_log(dir.path())?;
    let store = MemoryPageHandle::new();
    let writes = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let handle = WalCheckingHandle {
        inner: store.clone(),
        log: Arc::clone(&log),
        writes: Arc::clone(&writes),
        violations: Arc::clone(&violations),
    };
    let dirty = Arc::new(DirtyPageTable::new(DirtyTableConfig::default()));
    log.register_rec_lsn_source(dirty.clone());
    let pool = Arc::new(BufferManager::new(
        pool_config(8),
        Box::new(handle),
        Arc::clone(&log),
        Arc::clone(&dirty),
    )?);

    let workers: Vec<_> = (0..4u64)
        .map(|xid| {
            let pool = Arc::clone(&pool);
            let log = Arc::clone(&log);
            thread::spawn(move || -> Result<()> {
                let mut rng = rand::thread_rng();
                for round in 0..200u64 {
                    let page_id = PageId(rng.gen_range(0..32));
                    let mut page = pool.load_page_mut(xid, page_id, DATA)?;
                    let header = EntryHeader::new(EntryKind::Update, xid).with_page(page_id);
                    let lsn = log.append(header, &round.to_le_bytes())?;
                    page.data_mut()[..8].copy_from_slice(&round.to_le_bytes());
                    page.mark_dirty(lsn);
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    pool.close()?;
    assert!(writes.load(Ordering::SeqCst) > 0);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(dirty.is_empty());
    for page_id in 0..32 {
        if let Some(lsn) = store.stored_lsn(PageId(page_id)) {
            assert!(lsn < log.durable_lsn());
        }
    }
    log.close()?;
    Ok(())
}

#[test]
fn test_load_waits_for_a_free_frame() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let log = open_log(dir.path())?;
    let dirty = Arc::new(DirtyPageTable::new(DirtyTableConfig::default()));
    let pool = Arc::new(BufferManager::new(
        pool_config(4),
        Box::new(MemoryPageHandle::new()),
        Arc::clone(&log),
        dirty,
    )?);

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (held_tx, held_rx) = mpsc::channel::<()>();
    let holder = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || -> Result<()> {
            let guards = (0..4)
                .map(|i| pool.load_page(1, PageId(i), DATA))
                .collect::<Result<Vec<_>, _>>()?;
            held_tx.send(())?;
            release_rx.recv()?;
            drop(guards);
            Ok(())
        })
    };
    held_rx.recv()?;

    let loaded = Arc::new(AtomicBool::new(false));
    let waiter = {
        let pool = Arc::clone(&pool);
        let loaded = Arc::clone(&loaded);
        thread::spawn(move || -> Result<()> {
            let page = pool.load_page(2, PageId(4), DATA)?;
            assert_eq!(page.page_id(), PageId(4));
            loaded.store(true, Ordering::SeqCst);
            Ok(())
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!loaded.load(Ordering::SeqCst));
    assert!(pool.get_cached_page(PageId(0)).is_some());

    release_tx.send(())?;
    holder.join().expect("holder panicked")?;
    waiter.join().expect("waiter panicked")?;
    assert!(loaded.load(Ordering::SeqCst));
    assert!(pool.resident_count() <= 4);
    Ok(())
}

#[test]
fn test_flush_rejects_pages_held_by_caller() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let log = open_log(dir.path())?;
    let dirty = Arc::new(DirtyPageTable::new(DirtyTableConfig::default()));
    let pool = BufferManager::new(
        pool_config(4),
        Box::new(MemoryPageHandle::new()),
        Arc::clone(&log),
        Arc::clone(&dirty),
    )?;

    let mut page = pool.load_page_mut(1, PageId(3), DATA)?;
    let lsn = log.append(EntryHeader::new(EntryKind::Update, 1).with_page(PageId(3)), b"x")?;
    page.mark_dirty(lsn);

    assert!(matches!(
        pool.write_back_page(PageId(3)),
        Err(BufferError::PinnedByCaller(PageId(3)))
    ));
    assert!(matches!(
        pool.flush_until(Lsn::MAX),
        Err(BufferError::PinnedByCaller(_))
    ));
    assert!(pool.flush_range(PageId(0), PageId(2)).is_ok());

    page.release();
    pool.flush_until(Lsn::MAX)?;
    assert!(dirty.is_empty());
    Ok(())
}

#[test]
fn test_busy_page_is_written_back_after_release() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let log = open_log(dir.path())?;
    let store = MemoryPageHandle::new();
    let dirty = Arc::new(DirtyPageTable::new(DirtyTableConfig::default()));
    let pool = Arc::new(BufferManager::new(
        pool_config(4),
        Box::new(store.clone()),
        Arc::clone(&log),
        Arc::clone(&dirty),
    )?);

    let mut page = pool.load_page_mut(1, PageId(9), DATA)?;
    let lsn = log.append(EntryHeader::new(EntryKind::Update, 1).with_page(PageId(9)), b"y")?;
    page.data_mut()[0] = 0xab;
    page.mark_dirty(lsn);

    let busy = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.try_to_write_back_page(PageId(9)))
            .join()
            .expect("flusher panicked")
    };
    assert!(matches!(busy, Err(BufferError::Busy(PageId(9)))));
    assert!(store.stored_lsn(PageId(9)).is_none());

    page.release();
    for _ in 0..200 {
        if store.stored_lsn(PageId(9)) == Some(lsn) {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(store.stored_lsn(PageId(9)), Some(lsn));
    assert_eq!(store.stored_data(PageId(9)).map(|d| d[0]), Some(0xab));
    assert!(!dirty.is_dirty(PageId(9)));
    Ok(())
}
