use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::wal::Lsn;

/// Default page size in bytes.
pub const PAGE_SIZE: usize = 8192;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Page format tag, interpreted by the layer above the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PageType(pub u16);

impl PageType {
    /// A page nobody has formatted yet.
    pub const UNINITIALIZED: PageType = PageType(0);
}

/// In-memory image of one page: its bytes plus the LSN of the last log
/// entry applied to it.
#[derive(Clone)]
pub struct Page {
    id: PageId,
    page_type: PageType,
    lsn: Lsn,
    data: Box<[u8]>,
}

impl Page {
    pub fn new(id: PageId, page_type: PageType, page_size: usize) -> Self {
        Self {
            id,
            page_type,
            lsn: Lsn::ZERO,
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type;
    }

    /// LSN of the newest log entry reflected in this page.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Only page handles restoring a stored image should call this; updates
    /// go through `PageWriteGuard::mark_dirty`.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Reuse this buffer for another page.
    pub(crate) fn reset(&mut self, id: PageId, page_type: PageType) {
        self.id = id;
        self.page_type = page_type;
        self.lsn = Lsn::ZERO;
        self.data.fill(0);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("page_type", &self.page_type)
            .field("lsn", &self.lsn)
            .field("size", &self.data.len())
            .finish()
    }
}
