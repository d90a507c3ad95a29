use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;
use vibecore::recovery::TruncationConfig;
use vibecore::storage::wal::{CommitDurability, EntryKind, LogConfig, Lsn};
use vibecore::storage::{BufferConfig, FilePageHandle, PageId, PageType};
use vibecore::{Runtime, RuntimeConfig};

const DATA: PageType = PageType(1);
const PAGE_SIZE: usize = 256;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        log: LogConfig {
            log_dir: dir.join("wal"),
            ring_capacity_bits: 14,
            chunk_size: 1024,
            commit_durability: CommitDurability::Sync,
            ..Default::default()
        },
        buffer: BufferConfig {
            capacity: 16,
            page_size: PAGE_SIZE,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn open(dir: &Path, config: RuntimeConfig) -> Result<Runtime> {
    let handle = FilePageHandle::open(&dir.join("pages.db"), PAGE_SIZE)?;
    Ok(Runtime::open(config, Box::new(handle))?)
}

/// One transaction writing `value` into the first bytes of `page_id`.
fn write_and_commit(runtime: &Runtime, page_id: PageId, value: u64) -> Result<Lsn> {
    let xid = runtime.begin();
    let mut page = runtime.pool().load_page_mut(xid, page_id, DATA)?;
    runtime.log_update(xid, &mut page, &value.to_le_bytes(), |page| {
        page.data_mut()[..8].copy_from_slice(&value.to_le_bytes());
    })?;
    page.release();
    Ok(runtime.commit(xid)?)
}

fn read_value(runtime: &Runtime, page_id: PageId) -> Result<u64> {
    let page = runtime.pool().load_page(0, page_id, DATA)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&page.data()[..8]);
    Ok(u64::from_le_bytes(bytes))
}

#[test]
fn test_committed_pages_survive_reopen() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    {
        let runtime = open(dir.path(), config(dir.path()))?;
        for i in 0..8u64 {
            let commit = write_and_commit(&runtime, PageId(i), i * 11)?;
            assert!(runtime.log().durable_lsn() > commit);
        }
        assert!(runtime.transactions().is_empty());
        runtime.close()?;
    }

    let runtime = open(dir.path(), config(dir.path()))?;
    for i in 0..8u64 {
        assert_eq!(read_value(&runtime, PageId(i))?, i * 11);
    }
    let commits = runtime
        .log()
        .cursor(Lsn::ZERO)
        .filter(|entry| matches!(entry, Ok(e) if e.kind == EntryKind::Commit))
        .count();
    assert_eq!(commits, 8);
    runtime.close()?;
    Ok(())
}

#[test]
fn test_crash_keeps_committed_entries() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let committed = {
        let runtime = open(dir.path(), config(dir.path()))?;
        let commit = write_and_commit(&runtime, PageId(1), 42)?;

        let xid = runtime.begin();
        let mut page = runtime.pool().load_page_mut(xid, PageId(2), DATA)?;
        runtime.log_update(xid, &mut page, b"unfinished", |page| {
            page.data_mut()[0] = 1;
        })?;
        page.release();
        runtime.simulate_crash();
        commit
    };

    let runtime = open(dir.path(), config(dir.path()))?;
    let entry = runtime.log().read_entry(committed)?;
    assert_eq!(entry.kind, EntryKind::Commit);
    let update = runtime.log().read_entry(entry.prev_lsn.expect("commit follows its update"))?;
    assert_eq!(update.kind, EntryKind::Update);
    assert_eq!(update.page_id, Some(PageId(1)));
    assert_eq!(&update.payload[..], &42u64.to_le_bytes());
    Ok(())
}

#[test]
fn test_forced_truncation_writes_back_dirty_pages() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let runtime = open(dir.path(), config(dir.path()))?;
    for i in 0..100u64 {
        write_and_commit(&runtime, PageId(i % 10), i)?;
    }
    assert!(!runtime.dirty_pages().is_empty());

    assert!(runtime.truncate_now(true)?);
    assert!(runtime.dirty_pages().is_empty());
    assert!(runtime.log().truncation_point() > Lsn::ZERO);
    assert!(runtime.log().truncation_point() <= runtime.log().durable_lsn());

    // Nothing left to give up.
    assert!(!runtime.truncate_now(false)?);
    runtime.close()?;
    Ok(())
}

#[test]
fn test_active_transaction_holds_truncation_back() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let runtime = open(dir.path(), config(dir.path()))?;

    let long_running = runtime.begin();
    let first = {
        let mut page = runtime.pool().load_page_mut(long_running, PageId(50), DATA)?;
        runtime.log_update(long_running, &mut page, b"first", |page| {
            page.data_mut()[0] = 7;
        })?
    };
    for i in 0..100u64 {
        write_and_commit(&runtime, PageId(i % 10), i)?;
    }

    runtime.truncate_now(true)?;
    assert!(runtime.log().truncation_point() <= first);
    assert_eq!(runtime.log().read_entry(first)?.xid, long_running);

    runtime.commit(long_running)?;
    assert!(runtime.truncate_now(true)?);
    assert!(runtime.log().truncation_point() > first);
    runtime.close()?;
    Ok(())
}

#[test]
fn test_abort_and_end_keep_entries_until_end() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let runtime = open(dir.path(), config(dir.path()))?;

    let xid = runtime.begin();
    let update = {
        let mut page = runtime.pool().load_page_mut(xid, PageId(3), DATA)?;
        runtime.log_update(xid, &mut page, b"undo me", |page| {
            page.data_mut()[0] = 9;
        })?
    };
    let abort = runtime.abort(xid)?;
    assert!(runtime.transactions().is_active(xid));
    let rec_lsn = runtime.transactions().state(xid).and_then(|s| s.rec_lsn);
    assert!(rec_lsn.is_some_and(|lsn| lsn <= update));
    assert_eq!(runtime.transactions().min_rec_lsn(), rec_lsn);

    let end = runtime.end(xid)?;
    assert!(!runtime.transactions().is_active(xid));
    let entry = runtime.log().read_entry(end)?;
    assert_eq!(entry.kind, EntryKind::End);
    assert_eq!(entry.prev_lsn, Some(abort));
    runtime.close()?;
    Ok(())
}

#[test]
fn test_background_truncation() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let runtime = open(
        dir.path(),
        RuntimeConfig {
            truncation: Some(TruncationConfig {
                interval: Duration::from_millis(10),
                target_log_size: 512,
                min_incremental: 0,
            }),
            ..config(dir.path())
        },
    )?;

    for i in 0..100u64 {
        write_and_commit(&runtime, PageId(i % 4), i)?;
    }
    for _ in 0..400 {
        if runtime.log().truncation_point() > Lsn::ZERO {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(runtime.log().truncation_point() > Lsn::ZERO);
    runtime.close()?;
    Ok(())
}
