//! Log entry types and their on-disk framing.
//!
//! A frame is `len | body | crc`, where `len` and `crc` are little-endian
//! `u32`s and `crc` is the CRC32 of `body`. The body starts with a fixed
//! header:
//!
//! ```text
//! lsn: u64 | prev_lsn: u64 | xid: u64 | page: u64 | kind: u8 | payload...
//! ```
//!
//! A zero length word, or fewer than four bytes left in a chunk, marks
//! zero padding that runs to the end of the chunk.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::storage::page::PageId;

/// Size of the length word in front of every frame.
pub const LEN_SIZE: usize = 4;

/// Size of the checksum after every frame body.
pub const CRC_SIZE: usize = 4;

/// Size of the fixed body header.
pub const HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 1;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = LEN_SIZE + HEADER_SIZE + CRC_SIZE;

/// Payload size of a CRC marker.
pub const MARKER_PAYLOAD_SIZE: usize = 4;

/// Log Sequence Number: the logical byte offset of an entry's frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// Transaction identifier as recorded in log entries.
pub type Xid = u64;

/// Xid used by entries that belong to no transaction.
pub const NO_XID: Xid = u64::MAX;

const NO_PAGE: u64 = u64::MAX;

/// Entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Physical or logical change to a page.
    Update = 1,
    /// Transaction commit.
    Commit = 2,
    /// Transaction abort.
    Abort = 3,
    /// End of an aborted transaction's undo.
    End = 4,
    /// Compensation record written during undo.
    Clr = 5,
    /// Placeholder left by a reservation that was abandoned.
    Noop = 6,
    /// Internal checksum over every frame since the previous marker.
    Marker = 7,
}

impl EntryKind {
    pub fn is_internal(self) -> bool {
        matches!(self, EntryKind::Noop | EntryKind::Marker)
    }
}

impl TryFrom<u8> for EntryKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => EntryKind::Update,
            2 => EntryKind::Commit,
            3 => EntryKind::Abort,
            4 => EntryKind::End,
            5 => EntryKind::Clr,
            6 => EntryKind::Noop,
            7 => EntryKind::Marker,
            other => return Err(other),
        })
    }
}

/// The caller-supplied part of an entry header. The log adds the LSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub xid: Xid,
    pub prev_lsn: Option<Lsn>,
    pub page_id: Option<PageId>,
}

impl EntryHeader {
    pub fn new(kind: EntryKind, xid: Xid) -> Self {
        Self {
            kind,
            xid,
            prev_lsn: None,
            page_id: None,
        }
    }

    pub fn with_prev_lsn(mut self, prev_lsn: Option<Lsn>) -> Self {
        self.prev_lsn = prev_lsn;
        self
    }

    pub fn with_page(mut self, page_id: PageId) -> Self {
        self.page_id = Some(page_id);
        self
    }

    pub(crate) fn marker() -> Self {
        Self::new(EntryKind::Marker, NO_XID)
    }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub prev_lsn: Option<Lsn>,
    pub xid: Xid,
    pub page_id: Option<PageId>,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl LogEntry {
    /// Size of this entry's frame on disk.
    pub fn frame_len(&self) -> u64 {
        frame_len(self.payload.len()) as u64
    }

    /// Offset just past this entry's frame.
    pub fn end(&self) -> u64 {
        self.lsn.0 + self.frame_len()
    }
}

pub fn frame_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// Write the length word and body header into `frame`, which must be
/// exactly `frame_len(payload_len)` bytes.
pub(crate) fn write_header(frame: &mut [u8], lsn: Lsn, header: &EntryHeader) {
    let body_len = frame.len() - LEN_SIZE - CRC_SIZE;
    LittleEndian::write_u32(&mut frame[0..4], body_len as u32);
    let body = &mut frame[LEN_SIZE..];
    LittleEndian::write_u64(&mut body[0..8], lsn.0);
    LittleEndian::write_u64(&mut body[8..16], header.prev_lsn.map_or(u64::MAX, |l| l.0));
    LittleEndian::write_u64(&mut body[16..24], header.xid);
    LittleEndian::write_u64(&mut body[24..32], header.page_id.map_or(NO_PAGE, |p| p.0));
    body[32] = header.kind as u8;
}

/// Payload region of a frame.
pub(crate) fn payload_mut(frame: &mut [u8]) -> &mut [u8] {
    let end = frame.len() - CRC_SIZE;
    &mut frame[LEN_SIZE + HEADER_SIZE..end]
}

/// Overwrite the kind byte of an already-headed frame.
pub(crate) fn set_kind(frame: &mut [u8], kind: EntryKind) {
    frame[LEN_SIZE + 32] = kind as u8;
}

/// Compute and store the body checksum.
pub(crate) fn seal(frame: &mut [u8]) {
    let crc_at = frame.len() - CRC_SIZE;
    let crc = crc32fast::hash(&frame[LEN_SIZE..crc_at]);
    LittleEndian::write_u32(&mut frame[crc_at..], crc);
}

/// Read the kind byte of a complete frame without validating it.
pub(crate) fn peek_kind(frame: &[u8]) -> Option<EntryKind> {
    frame
        .get(LEN_SIZE + 32)
        .and_then(|b| EntryKind::try_from(*b).ok())
}

/// What sits at a given position inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlot {
    /// Zero padding up to the end of the chunk.
    Padding,
    /// A frame of this many bytes.
    Frame(usize),
}

/// Classify the bytes at a position that has `room` bytes left in its
/// chunk. `prefix` must hold at least `min(room, LEN_SIZE)` bytes.
pub(crate) fn classify(prefix: &[u8], room: u64) -> FrameSlot {
    if room < LEN_SIZE as u64 {
        return FrameSlot::Padding;
    }
    match LittleEndian::read_u32(&prefix[..LEN_SIZE]) {
        0 => FrameSlot::Padding,
        body_len => FrameSlot::Frame(LEN_SIZE + body_len as usize + CRC_SIZE),
    }
}

/// Why a frame failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Short,
    Checksum { stored: u32, computed: u32 },
    LsnMismatch { stored: u64 },
    UnknownKind(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Short => write!(f, "short frame"),
            FrameError::Checksum { stored, computed } => {
                write!(f, "crc mismatch: stored {stored:#010x}, computed {computed:#010x}")
            }
            FrameError::LsnMismatch { stored } => write!(f, "frame claims lsn {stored}"),
            FrameError::UnknownKind(k) => write!(f, "unknown entry kind {k}"),
        }
    }
}

/// Validate and decode a complete frame found at `lsn`.
pub(crate) fn decode(frame: &[u8], lsn: Lsn) -> Result<LogEntry, FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::Short);
    }
    let body_len = LittleEndian::read_u32(&frame[0..4]) as usize;
    if frame.len() != LEN_SIZE + body_len + CRC_SIZE {
        return Err(FrameError::Short);
    }
    let body = &frame[LEN_SIZE..LEN_SIZE + body_len];
    let stored = LittleEndian::read_u32(&frame[LEN_SIZE + body_len..]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(FrameError::Checksum { stored, computed });
    }

    let stored_lsn = LittleEndian::read_u64(&body[0..8]);
    if stored_lsn != lsn.0 {
        return Err(FrameError::LsnMismatch { stored: stored_lsn });
    }
    let prev = LittleEndian::read_u64(&body[8..16]);
    let xid = LittleEndian::read_u64(&body[16..24]);
    let page = LittleEndian::read_u64(&body[24..32]);
    let kind = EntryKind::try_from(body[32]).map_err(FrameError::UnknownKind)?;

    Ok(LogEntry {
        lsn,
        prev_lsn: (prev != u64::MAX).then_some(Lsn(prev)),
        xid,
        page_id: (page != NO_PAGE).then_some(PageId(page)),
        kind,
        payload: Bytes::copy_from_slice(&body[HEADER_SIZE..]),
    })
}

/// The checksum stored in a marker's payload.
pub(crate) fn marker_crc(entry: &LogEntry) -> Option<u32> {
    (entry.kind == EntryKind::Marker && entry.payload.len() == MARKER_PAYLOAD_SIZE)
        .then(|| LittleEndian::read_u32(&entry.payload))
}
