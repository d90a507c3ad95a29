use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use parking_lot::Mutex;

use super::PageHandle;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::wal::Lsn;

/// Bytes stored after each page image: LSN, page type, reserved.
pub const TRAILER_SIZE: usize = 16;

/// Pages stored back to back in a single file. Each slot holds the page
/// image followed by a small trailer carrying its LSN and type.
pub struct FilePageHandle {
    path: PathBuf,
    page_size: usize,
    file: Mutex<File>,
    poisoned: Arc<AtomicBool>,
}

impl FilePageHandle {
    pub fn open(path: &Path, page_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        debug!("Opened page file {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(file),
            poisoned: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot_size(&self) -> u64 {
        (self.page_size + TRAILER_SIZE) as u64
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.0 * self.slot_size()
    }

    /// Number of page slots the file currently holds.
    pub fn num_pages(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len() / self.slot_size())
    }

    fn check(&self) -> io::Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(io::Error::other("page file handle failed earlier"));
        }
        Ok(())
    }

    fn poison(&self, what: &str, err: io::Error) -> io::Error {
        error!("Page file {:?} {} failed: {}", self.path, what, err);
        self.poisoned.store(true, Ordering::Release);
        err
    }

    fn check_size(&self, page: &Page) -> io::Result<()> {
        if page.size() != self.page_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page buffer is {} bytes, expected {}",
                    page.size(),
                    self.page_size
                ),
            ));
        }
        Ok(())
    }
}

impl PageHandle for FilePageHandle {
    fn read(&self, page: &mut Page) -> io::Result<()> {
        self.check()?;
        self.check_size(page)?;

        let offset = self.page_offset(page.id());
        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();
        if offset + self.slot_size() > file_size {
            page.data_mut().fill(0);
            page.set_lsn(Lsn::ZERO);
            return Ok(());
        }

        let mut trailer = [0u8; TRAILER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(page.data_mut())?;
        file.read_exact(&mut trailer)?;
        page.set_lsn(Lsn(LittleEndian::read_u64(&trailer[0..8])));
        let stored_type = PageType(LittleEndian::read_u16(&trailer[8..10]));
        if stored_type != PageType::UNINITIALIZED {
            page.set_page_type(stored_type);
        }
        Ok(())
    }

    fn write(&self, page: &Page) -> io::Result<()> {
        self.check()?;
        self.check_size(page)?;

        let mut trailer = [0u8; TRAILER_SIZE];
        LittleEndian::write_u64(&mut trailer[0..8], page.lsn().0);
        LittleEndian::write_u16(&mut trailer[8..10], page.page_type().0);

        let offset = self.page_offset(page.id());
        let mut file = self.file.lock();
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(page.data()))
            .and_then(|_| file.write_all(&trailer));
        result.map_err(|e| self.poison("write", e))
    }

    fn force_file(&self) -> io::Result<()> {
        self.check()?;
        let file = self.file.lock();
        file.sync_data().map_err(|e| self.poison("sync", e))
    }

    fn force_range(&self, start: PageId, stop: PageId) -> io::Result<()> {
        if start >= stop {
            return Ok(());
        }
        // Range syncs are not portable; sync the whole file.
        self.force_file()
    }

    fn dup(&self) -> io::Result<Box<dyn PageHandle>> {
        self.check()?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(FilePageHandle {
            path: self.path.clone(),
            page_size: self.page_size,
            file: Mutex::new(file),
            poisoned: Arc::clone(&self.poisoned),
        }))
    }
}
