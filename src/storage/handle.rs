//! Physical page I/O used by the buffer manager's load and write-back paths.

pub mod file;
pub mod memory;

use std::io;

use crate::storage::page::{Page, PageId};

pub use file::FilePageHandle;
pub use memory::MemoryPageHandle;

/// Where pages live when they are not cached.
pub trait PageHandle: Send + Sync {
    /// Fill `page` with the stored image of `page.id()`. A page that was
    /// never written reads as zeroes with LSN zero.
    fn read(&self, page: &mut Page) -> io::Result<()>;

    /// Store `page`, including its LSN.
    fn write(&self, page: &Page) -> io::Result<()>;

    /// Make every completed write durable.
    fn force_file(&self) -> io::Result<()>;

    /// Make writes to pages in `[start, stop)` durable.
    fn force_range(&self, start: PageId, stop: PageId) -> io::Result<()>;

    /// Another handle onto the same pages.
    fn dup(&self) -> io::Result<Box<dyn PageHandle>>;
}

impl<H: PageHandle + ?Sized> PageHandle for Box<H> {
    fn read(&self, page: &mut Page) -> io::Result<()> {
        (**self).read(page)
    }

    fn write(&self, page: &Page) -> io::Result<()> {
        (**self).write(page)
    }

    fn force_file(&self) -> io::Result<()> {
        (**self).force_file()
    }

    fn force_range(&self, start: PageId, stop: PageId) -> io::Result<()> {
        (**self).force_range(start, stop)
    }

    fn dup(&self) -> io::Result<Box<dyn PageHandle>> {
        (**self).dup()
    }
}
