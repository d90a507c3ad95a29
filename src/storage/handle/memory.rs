use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::PageHandle;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::wal::Lsn;

#[derive(Clone)]
struct StoredPage {
    data: Box<[u8]>,
    lsn: Lsn,
    page_type: PageType,
}

/// Pages kept in a shared map. Every `dup` sees the same map.
#[derive(Clone, Default)]
pub struct MemoryPageHandle {
    pages: Arc<Mutex<HashMap<PageId, StoredPage>>>,
}

impl MemoryPageHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// LSN of the stored copy of `page_id`, if it was ever written.
    pub fn stored_lsn(&self, page_id: PageId) -> Option<Lsn> {
        self.pages.lock().get(&page_id).map(|p| p.lsn)
    }

    /// Stored bytes of `page_id`, if it was ever written.
    pub fn stored_data(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages.lock().get(&page_id).map(|p| p.data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageHandle for MemoryPageHandle {
    fn read(&self, page: &mut Page) -> io::Result<()> {
        let pages = self.pages.lock();
        match pages.get(&page.id()) {
            Some(stored) if stored.data.len() == page.size() => {
                page.data_mut().copy_from_slice(&stored.data);
                page.set_lsn(stored.lsn);
                page.set_page_type(stored.page_type);
            }
            Some(stored) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "stored page is {} bytes, buffer is {}",
                        stored.data.len(),
                        page.size()
                    ),
                ))
            }
            None => {
                page.data_mut().fill(0);
                page.set_lsn(Lsn::ZERO);
            }
        }
        Ok(())
    }

    fn write(&self, page: &Page) -> io::Result<()> {
        self.pages.lock().insert(
            page.id(),
            StoredPage {
                data: page.data().into(),
                lsn: page.lsn(),
                page_type: page.page_type(),
            },
        );
        Ok(())
    }

    fn force_file(&self) -> io::Result<()> {
        Ok(())
    }

    fn force_range(&self, _start: PageId, _stop: PageId) -> io::Result<()> {
        Ok(())
    }

    fn dup(&self) -> io::Result<Box<dyn PageHandle>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let handle = MemoryPageHandle::new();
        let mut page = Page::new(PageId(1), PageType(2), 64);
        page.data_mut()[3] = 3;
        page.set_lsn(Lsn(17));
        handle.write(&page).unwrap();

        let dup = handle.dup().unwrap();
        let mut read = Page::new(PageId(1), PageType::UNINITIALIZED, 64);
        dup.read(&mut read).unwrap();
        assert_eq!(read.data()[3], 3);
        assert_eq!(read.lsn(), Lsn(17));
        assert_eq!(read.page_type(), PageType(2));
        assert_eq!(handle.stored_lsn(PageId(1)), Some(Lsn(17)));
        assert_eq!(handle.stored_lsn(PageId(2)), None);
    }
}
