//! Fixed-size chunk files backing the logical log.
//!
//! Chunk `n` holds log offsets `[n * chunk_size, (n + 1) * chunk_size)` and
//! lives in a file named after its base offset. Retired chunks are renamed
//! with a `~` suffix and kept in a dead pool so the next chunk can reuse the
//! file instead of allocating a new one.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use super::entry::{self, EntryKind, FrameSlot, LogEntry, Lsn, LEN_SIZE};
use crate::storage::error::{LogError, LogResult};

/// Prefix of every chunk file name.
pub const CHUNK_FILE_PREFIX: &str = "log-";

/// Suffix of retired chunk files.
pub const DEAD_SUFFIX: char = '~';

/// Width of the zero-padded base offset in a chunk file name.
pub const NAME_DIGITS: usize = 20;

fn live_name(base: u64) -> String {
    format!("{CHUNK_FILE_PREFIX}{base:0width$}", width = NAME_DIGITS)
}

enum FileKind {
    Live(u64),
    Dead,
    Unknown,
}

fn classify_name(name: &str) -> FileKind {
    let Some(rest) = name.strip_prefix(CHUNK_FILE_PREFIX) else {
        return FileKind::Unknown;
    };
    let (digits, dead) = match rest.strip_suffix(DEAD_SUFFIX) {
        // Retired files may carry a `.N` generation after the base.
        Some(dead) => match dead.split_once('.') {
            Some((digits, generation)) if generation.parse::<u64>().is_ok() => (digits, true),
            Some(_) => return FileKind::Unknown,
            None => (dead, true),
        },
        None => (rest, false),
    };
    if digits.len() != NAME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return FileKind::Unknown;
    }
    match (dead, digits.parse::<u64>()) {
        (true, Ok(_)) => FileKind::Dead,
        (false, Ok(base)) => FileKind::Live(base),
        _ => FileKind::Unknown,
    }
}

/// One chunk file.
pub struct Segment {
    base: u64,
    path: PathBuf,
    file: Mutex<File>,
}

impl Segment {
    fn open(base: u64, path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            base,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(buf)
    }

    fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        let file = self.file.lock();
        file.set_len(len)?;
        file.sync_all()
    }

    fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }
}

struct Chunks {
    /// Lowest base first; bases are contiguous.
    live: VecDeque<Arc<Segment>>,
    dead: Vec<PathBuf>,
}

impl Chunks {
    fn containing(&self, offset: u64, chunk_size: u64) -> Option<Arc<Segment>> {
        let first = self.live.front()?.base;
        if offset < first {
            return None;
        }
        let idx = ((offset - first) / chunk_size) as usize;
        self.live.get(idx).cloned()
    }
}

struct WriterState {
    /// Checksum of every non-marker frame since the last marker or the
    /// start of the current chunk.
    crc: Hasher,
    current: Option<Arc<Segment>>,
}

/// Where a reopened log left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredLog {
    /// First offset after the last verified marker.
    pub next_lsn: Lsn,
    /// First offset still held by a live chunk.
    pub truncation_point: Lsn,
    /// Bytes of unverified data that were cut off.
    pub discarded_bytes: u64,
}

pub struct SegmentStore {
    dir: PathBuf,
    chunk_size: u64,
    chunks: RwLock<Chunks>,
    writer: Mutex<WriterState>,
    poisoned: AtomicBool,
}

impl SegmentStore {
    /// Open the chunk directory, creating it if needed, and cut the log back
    /// to its last verified CRC marker.
    pub fn open(dir: &Path, chunk_size: u64) -> LogResult<(Self, RecoveredLog)> {
        fs::create_dir_all(dir)?;

        let mut live = BTreeMap::new();
        let mut dead = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            match classify_name(&name) {
                FileKind::Live(base) if base % chunk_size == 0 => {
                    live.insert(base, dir_entry.path());
                }
                FileKind::Live(base) => {
                    warn!("Ignoring log chunk {} with misaligned base {}", name, base);
                }
                FileKind::Dead => dead.push(dir_entry.path()),
                FileKind::Unknown => warn!("Unknown file in log dir: {}", name),
            }
        }

        let store = Self {
            dir: dir.to_path_buf(),
            chunk_size,
            chunks: RwLock::new(Chunks {
                live: VecDeque::new(),
                dead,
            }),
            writer: Mutex::new(WriterState {
                crc: Hasher::new(),
                current: None,
            }),
            poisoned: AtomicBool::new(false),
        };

        {
            let mut chunks = store.chunks.write();
            let mut expected = None;
            for (base, path) in live {
                if expected.is_some_and(|e| e != base) {
                    warn!("Log chunk {} does not follow its predecessor; retiring it", base);
                    store.retire(&mut chunks, base, &path)?;
                    continue;
                }
                chunks.live.push_back(Arc::new(Segment::open(base, path)?));
                expected = Some(base + chunk_size);
            }
        }

        let recovered = store.recover()?;
        info!(
            "Opened log at {:?}: next {}, truncation point {}, {} bytes discarded",
            store.dir, recovered.next_lsn, recovered.truncation_point, recovered.discarded_bytes
        );
        Ok((store, recovered))
    }

    fn dead_path(&self, base: u64, generation: u64) -> PathBuf {
        let name = match generation {
            0 => format!("{}{}", live_name(base), DEAD_SUFFIX),
            n => format!("{}.{}{}", live_name(base), n, DEAD_SUFFIX),
        };
        self.dir.join(name)
    }

    /// Move the chunk file at `path` into the dead pool under a name no
    /// pooled or existing file already uses.
    fn retire(&self, chunks: &mut Chunks, base: u64, path: &Path) -> io::Result<()> {
        let mut generation = 0;
        let mut dead_path = self.dead_path(base, generation);
        while chunks.dead.contains(&dead_path) || dead_path.exists() {
            generation += 1;
            dead_path = self.dead_path(base, generation);
        }
        fs::rename(path, &dead_path)?;
        chunks.dead.push(dead_path);
        Ok(())
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison<E: std::fmt::Display>(&self, what: &str, err: E) -> LogError {
        error!("Log {} failed: {}; marking log handle as errored", what, err);
        self.poisoned.store(true, Ordering::Release);
        LogError::Poisoned
    }

    fn check(&self) -> LogResult<()> {
        if self.is_poisoned() {
            return Err(LogError::Poisoned);
        }
        Ok(())
    }

    /// Scan forward from the oldest chunk and find the end of the last CRC
    /// marker that verifies. Everything after it is discarded.
    fn recover(&self) -> LogResult<RecoveredLog> {
        let mut chunks = self.chunks.write();
        let Some(first) = chunks.live.front().map(|s| s.base) else {
            return Ok(RecoveredLog {
                next_lsn: Lsn::ZERO,
                truncation_point: Lsn::ZERO,
                discarded_bytes: 0,
            });
        };

        let mut verified_end = first;
        let mut scanned_end = first;
        'chunks: for segment in chunks.live.iter() {
            let data = segment.read_all()?;
            scanned_end = segment.base + data.len() as u64;
            let mut crc = Hasher::new();
            let mut pos = 0usize;
            loop {
                let room = self.chunk_size - pos as u64;
                let want = (room as usize).min(LEN_SIZE);
                if data.len() < pos + want || (pos == data.len() && room > 0) {
                    break 'chunks;
                }
                match entry::classify(&data[pos..], room) {
                    FrameSlot::Padding => {
                        let full = data.len() as u64 == self.chunk_size;
                        if !full || data[pos..].iter().any(|b| *b != 0) {
                            break 'chunks;
                        }
                        continue 'chunks;
                    }
                    FrameSlot::Frame(len) => {
                        if len as u64 > room || pos + len > data.len() {
                            break 'chunks;
                        }
                        let lsn = Lsn(segment.base + pos as u64);
                        let frame = &data[pos..pos + len];
                        let decoded = match entry::decode(frame, lsn) {
                            Ok(decoded) => decoded,
                            Err(err) => {
                                debug!("Log scan stopped at {}: {}", lsn, err);
                                break 'chunks;
                            }
                        };
                        if decoded.kind == EntryKind::Marker {
                            let expected = crc.clone().finalize();
                            if entry::marker_crc(&decoded) != Some(expected) {
                                debug!("Log scan stopped at {}: marker does not verify", lsn);
                                break 'chunks;
                            }
                            verified_end = lsn.0 + len as u64;
                            crc = Hasher::new();
                        } else {
                            crc.update(frame);
                        }
                        pos += len;
                    }
                }
            }
        }

        // Keep chunks up to the one holding `verified_end`; cut that one back
        // and retire the rest.
        let mut discarded = scanned_end.saturating_sub(verified_end);
        while chunks.live.len() > 1 {
            let Some(last) = chunks.live.back().cloned() else {
                break;
            };
            if last.base <= verified_end {
                break;
            }
            self.retire(&mut chunks, last.base, &last.path)?;
            chunks.live.pop_back();
            warn!("Retired unverified log chunk {}", last.base);
        }
        if let Some(tail) = chunks.live.back().cloned() {
            let keep = verified_end.saturating_sub(tail.base).min(self.chunk_size);
            let on_disk = tail.file.lock().metadata()?.len();
            if on_disk > keep {
                discarded = discarded.max(on_disk - keep);
                tail.set_len(keep)?;
                info!("Truncated log chunk {} to {} bytes", tail.base, keep);
            }
        }

        let mut writer = self.writer.lock();
        writer.current = chunks.containing(verified_end, self.chunk_size);

        Ok(RecoveredLog {
            next_lsn: Lsn(verified_end),
            truncation_point: Lsn(first),
            discarded_bytes: discarded,
        })
    }

    /// Open the chunk starting at `base`, recycling a dead file if one is
    /// available.
    fn append_chunk(&self, base: u64) -> LogResult<Arc<Segment>> {
        let mut chunks = self.chunks.write();
        if let Some(existing) = chunks.containing(base, self.chunk_size) {
            return Ok(existing);
        }
        if let Some(last) = chunks.live.back() {
            debug_assert_eq!(last.base + self.chunk_size, base);
        }

        let path = self.dir.join(live_name(base));
        if let Some(dead) = chunks.dead.pop() {
            fs::rename(&dead, &path).map_err(|e| self.poison("chunk recycle", e))?;
            debug!("Recycled {:?} as log chunk {}", dead, base);
        } else {
            debug!("Creating log chunk {}", base);
        }
        let segment = Arc::new(Segment::open(base, path).map_err(|e| self.poison("chunk open", e))?);
        chunks.live.push_back(Arc::clone(&segment));
        Ok(segment)
    }

    fn segment_for_write(&self, writer: &mut WriterState, base: u64) -> LogResult<Arc<Segment>> {
        if let Some(current) = writer.current.as_ref().filter(|s| s.base == base) {
            return Ok(Arc::clone(current));
        }
        if let Some(previous) = writer.current.take() {
            // Later chunks must never become durable ahead of earlier ones.
            previous.sync().map_err(|e| self.poison("chunk sync", e))?;
        }
        let segment = self.append_chunk(base)?;
        writer.current = Some(Arc::clone(&segment));
        Ok(segment)
    }

    /// Write a drained span of the ring to its chunks.
    ///
    /// `span` starts and ends on frame boundaries. CRC markers found in the
    /// span get their checksum filled in on the way to disk. Returns the end
    /// of the last marker in the span, if there was one.
    pub fn write_back(&self, span: &[u8], offset: u64) -> LogResult<Option<u64>> {
        self.check()?;
        let mut writer = self.writer.lock();
        let end = offset + span.len() as u64;
        let mut pos = offset;
        let mut last_marker = None;

        while pos < end {
            let base = pos - pos % self.chunk_size;
            let chunk_end = base + self.chunk_size;
            let segment = self.segment_for_write(&mut writer, base)?;
            if pos == base {
                writer.crc = Hasher::new();
            }

            let piece_end = end.min(chunk_end);
            let mut run_start = pos;
            while pos < piece_end {
                let rel = (pos - offset) as usize;
                match entry::classify(&span[rel..], chunk_end - pos) {
                    FrameSlot::Padding => pos = piece_end,
                    FrameSlot::Frame(len) => {
                        let frame = &span[rel..rel + len];
                        if entry::peek_kind(frame) == Some(EntryKind::Marker) {
                            self.write_run(&segment, span, offset, run_start, pos)?;
                            let mut patched = frame.to_vec();
                            let crc = std::mem::replace(&mut writer.crc, Hasher::new()).finalize();
                            LittleEndian::write_u32(entry::payload_mut(&mut patched), crc);
                            entry::seal(&mut patched);
                            segment
                                .write_at(pos - base, &patched)
                                .map_err(|e| self.poison("chunk write", e))?;
                            trace!("Wrote marker at {} (crc {:#010x})", pos, crc);
                            run_start = pos + len as u64;
                            last_marker = Some(run_start);
                        } else {
                            writer.crc.update(frame);
                        }
                        pos += len as u64;
                    }
                }
            }
            self.write_run(&segment, span, offset, run_start, piece_end)?;
        }
        Ok(last_marker)
    }

    fn write_run(&self, segment: &Segment, span: &[u8], offset: u64, from: u64, to: u64) -> LogResult<()> {
        if from >= to {
            return Ok(());
        }
        let bytes = &span[(from - offset) as usize..(to - offset) as usize];
        segment
            .write_at(from - segment.base, bytes)
            .map_err(|e| self.poison("chunk write", e))
    }

    /// Fsync every chunk overlapping `[from, to)`.
    pub fn sync_range(&self, from: u64, to: u64) -> LogResult<()> {
        self.check()?;
        let targets: Vec<_> = self
            .chunks
            .read()
            .live
            .iter()
            .filter(|s| s.base < to && s.base + self.chunk_size > from)
            .cloned()
            .collect();
        for segment in targets {
            segment.sync().map_err(|e| self.poison("chunk sync", e))?;
        }
        Ok(())
    }

    /// Read the frame at `lsn`. `Ok(None)` means `lsn` sits in padding.
    pub fn read_entry(&self, lsn: Lsn) -> LogResult<Option<LogEntry>> {
        let segment = {
            let chunks = self.chunks.read();
            match chunks.containing(lsn.0, self.chunk_size) {
                Some(segment) => segment,
                None => {
                    let truncation_point = chunks.live.front().map_or(lsn, |s| Lsn(s.base));
                    return Err(LogError::Truncated {
                        lsn,
                        truncation_point,
                    });
                }
            }
        };

        let rel = lsn.0 - segment.base;
        let room = self.chunk_size - rel;
        let mut prefix = [0u8; LEN_SIZE];
        let want = (room as usize).min(LEN_SIZE);
        self.read_exact(&segment, rel, &mut prefix[..want], lsn)?;

        match entry::classify(&prefix[..want], room) {
            FrameSlot::Padding => Ok(None),
            FrameSlot::Frame(len) if len as u64 > room => Err(LogError::Corruption {
                lsn,
                reason: format!("frame of {len} bytes overruns its chunk"),
            }),
            FrameSlot::Frame(len) => {
                let mut frame = vec![0u8; len];
                self.read_exact(&segment, rel, &mut frame, lsn)?;
                entry::decode(&frame, lsn)
                    .map(Some)
                    .map_err(|err| LogError::Corruption {
                        lsn,
                        reason: err.to_string(),
                    })
            }
        }
    }

    fn read_exact(&self, segment: &Segment, pos: u64, buf: &mut [u8], lsn: Lsn) -> LogResult<()> {
        match segment.read_at(pos, buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(LogError::Corruption {
                lsn,
                reason: "short read".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Retire every chunk that lies entirely below `lsn`. The newest chunk
    /// always stays live. Returns the number of chunks retired.
    pub fn truncate(&self, lsn: Lsn) -> LogResult<usize> {
        self.check()?;
        let mut chunks = self.chunks.write();
        let mut retired = 0;
        while chunks.live.len() > 1 {
            let Some(oldest) = chunks.live.front().cloned() else {
                break;
            };
            if oldest.base + self.chunk_size > lsn.0 {
                break;
            }
            self.retire(&mut chunks, oldest.base, &oldest.path)
                .map_err(|e| self.poison("chunk retire", e))?;
            chunks.live.pop_front();
            retired += 1;
        }
        if retired > 0 {
            info!("Retired {} log chunk(s); log now starts at {}", retired, self.first_offset_locked(&chunks));
        }
        Ok(retired)
    }

    fn first_offset_locked(&self, chunks: &Chunks) -> u64 {
        chunks.live.front().map_or(0, |s| s.base)
    }

    /// First offset held by a live chunk, if any chunk exists.
    pub fn first_offset(&self) -> Option<u64> {
        self.chunks.read().live.front().map(|s| s.base)
    }

    pub fn live_count(&self) -> usize {
        self.chunks.read().live.len()
    }

    pub fn dead_count(&self) -> usize {
        self.chunks.read().dead.len()
    }
}
