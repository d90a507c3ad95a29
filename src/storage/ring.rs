//! Bounded multi-producer/multi-consumer byte ring for the log tail.
//!
//! Offsets are logical and grow without bound; the physical position of a
//! byte is `offset & mask`. Four offsets partition the logical space:
//!
//! ```text
//! read_tail <= read_frontier <= write_tail <= write_frontier
//! ```
//!
//! - `read_tail`: first byte some reader may still be looking at. Earlier
//!   bytes can be reused by writers.
//! - `read_frontier`: first byte handed out by the next `consume_bytes`.
//! - `write_tail`: first byte some writer may still be filling in. Earlier
//!   bytes are stable for readers.
//! - `write_frontier`: first unreserved byte.
//!
//! The backing store is twice the capacity and the upper half mirrors the
//! lower half, so every window of at most `capacity` bytes is contiguous in
//! memory even when it wraps around the logical end of the ring.

use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use log::trace;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Smallest supported ring, in bits of capacity.
pub const MIN_CAPACITY_BITS: u32 = 3;

/// Largest supported ring, in bits of capacity.
pub const MAX_CAPACITY_BITS: u32 = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer is full: {requested} bytes requested, {available} free")]
    Full { requested: u64, available: u64 },

    #[error("requested span is still being written")]
    Volatile,

    #[error("request of {requested} bytes exceeds ring capacity {capacity}")]
    TooLarge { requested: u64, capacity: u64 },

    #[error("read tail has not reached offset {0} yet")]
    WouldBlock(u64),

    #[error("ring buffer has been shut down")]
    Closed,

    #[error("invalid ring capacity: 2^{0}")]
    InvalidCapacity(u32),
}

pub type RingResult<T> = Result<T, RingError>;

/// How many bytes a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeLen {
    /// Exactly this many bytes, starting at the read frontier.
    Bytes(u64),
    /// Everything that is currently stable.
    Next,
}

/// Snapshot of the four ring pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingOffsets {
    pub read_tail: u64,
    pub read_frontier: u64,
    pub write_tail: u64,
    pub write_frontier: u64,
}

struct RingState {
    offsets: RingOffsets,
    writers: BTreeSet<u64>,
    readers: BTreeSet<u64>,
    shutdown: bool,
}

impl RingState {
    fn free_space(&self, capacity: u64) -> u64 {
        capacity - (self.offsets.write_frontier - self.offsets.read_tail)
    }

    fn drained(&self) -> bool {
        self.writers.is_empty() && self.offsets.read_frontier == self.offsets.write_frontier
    }

    fn check_order(&self) {
        let o = &self.offsets;
        debug_assert!(o.read_tail <= o.read_frontier);
        debug_assert!(o.read_frontier <= o.write_tail);
        debug_assert!(o.write_tail <= o.write_frontier);
    }
}

pub struct RingBuffer {
    memory: Box<[UnsafeCell<u8>]>,
    mask: u64,
    capacity: u64,
    state: Mutex<RingState>,
    read_done: Condvar,
    write_done: Condvar,
}

// SAFETY: byte windows are only handed out through reservations, and the
// offset bookkeeping guarantees that no two live reservations overlap a
// writer's window. All other state sits behind the mutex.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity_bits: u32) -> RingResult<Self> {
        Self::with_initial_offset(capacity_bits, 0)
    }

    /// Create a ring whose logical address space starts at `initial_offset`.
    /// Used when reopening a log whose tail is not at zero.
    pub fn with_initial_offset(capacity_bits: u32, initial_offset: u64) -> RingResult<Self> {
        if !(MIN_CAPACITY_BITS..=MAX_CAPACITY_BITS).contains(&capacity_bits) {
            return Err(RingError::InvalidCapacity(capacity_bits));
        }
        let capacity = 1u64 << capacity_bits;
        let memory = (0..capacity * 2)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            memory,
            mask: capacity - 1,
            capacity,
            state: Mutex::new(RingState {
                offsets: RingOffsets {
                    read_tail: initial_offset,
                    read_frontier: initial_offset,
                    write_tail: initial_offset,
                    write_frontier: initial_offset,
                },
                writers: BTreeSet::new(),
                readers: BTreeSet::new(),
                shutdown: false,
            }),
            read_done: Condvar::new(),
            write_done: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn offsets(&self) -> RingOffsets {
        self.state.lock().offsets
    }

    pub fn write_frontier(&self) -> u64 {
        self.state.lock().offsets.write_frontier
    }

    pub fn read_tail(&self) -> u64 {
        self.state.lock().offsets.read_tail
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Reserve `len` contiguous bytes at the write frontier, blocking while
    /// the ring is full.
    pub fn reserve_space(&self, len: u64) -> RingResult<WriteReservation<'_>> {
        self.reserve_padded(len, |_| 0)
    }

    pub fn try_reserve_space(&self, len: u64) -> RingResult<WriteReservation<'_>> {
        self.check_len(len)?;
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(RingError::Closed);
        }
        let available = state.free_space(self.capacity);
        if available < len {
            return Err(RingError::Full {
                requested: len,
                available,
            });
        }
        Ok(self.grant_write(&mut state, len))
    }

    /// Reserve `len` bytes preceded by `pad(write_frontier)` bytes of padding.
    ///
    /// The padding is computed under the ring lock, so the caller learns
    /// where its window lands before anyone else can reserve. The returned
    /// reservation covers padding and payload; the padding is zero-filled.
    pub fn reserve_padded<F>(&self, len: u64, pad: F) -> RingResult<WriteReservation<'_>>
    where
        F: Fn(u64) -> u64,
    {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(RingError::Closed);
            }
            let total = pad(state.offsets.write_frontier) + len;
            self.check_len(total)?;
            if state.free_space(self.capacity) >= total {
                let padding = total - len;
                let mut reservation = self.grant_write(&mut state, total);
                drop(state);
                reservation[..padding as usize].fill(0);
                reservation.padding = padding;
                return Ok(reservation);
            }
            self.read_done.wait(&mut state);
        }
    }

    fn check_len(&self, len: u64) -> RingResult<()> {
        if len > self.capacity {
            return Err(RingError::TooLarge {
                requested: len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn grant_write(&self, state: &mut RingState, len: u64) -> WriteReservation<'_> {
        let offset = state.offsets.write_frontier;
        state.offsets.write_frontier += len;
        state.writers.insert(offset);
        state.check_order();
        trace!("ring: reserved [{}, {})", offset, offset + len);
        WriteReservation {
            ring: self,
            offset,
            len,
            padding: 0,
        }
    }

    fn write_done(&self, offset: u64, len: u64) {
        self.mirror(offset, len);

        let mut state = self.state.lock();
        state.writers.remove(&offset);
        let new_tail = state
            .writers
            .first()
            .copied()
            .unwrap_or(state.offsets.write_frontier);
        if new_tail != state.offsets.write_tail {
            debug_assert!(new_tail > state.offsets.write_tail);
            state.offsets.write_tail = new_tail;
            state.check_order();
            self.write_done.notify_all();
        }
    }

    /// Claim the next readable span without blocking.
    pub fn try_consume_bytes(&self, len: ConsumeLen) -> RingResult<ReadReservation<'_>> {
        let mut state = self.state.lock();
        self.nb_consume(&mut state, len)
    }

    /// Claim the next readable span, blocking while it is still volatile.
    ///
    /// After `shutdown`, remaining data is still handed out; once the ring is
    /// drained this returns `Closed`.
    pub fn consume_bytes(&self, len: ConsumeLen) -> RingResult<ReadReservation<'_>> {
        let mut state = self.state.lock();
        loop {
            match self.nb_consume(&mut state, len) {
                Err(RingError::Volatile) => {
                    if state.shutdown && state.drained() {
                        return Err(RingError::Closed);
                    }
                    self.write_done.wait(&mut state);
                }
                other => return other,
            }
        }
    }

    fn nb_consume(&self, state: &mut RingState, len: ConsumeLen) -> RingResult<ReadReservation<'_>> {
        let offset = state.offsets.read_frontier;
        let len = match len {
            ConsumeLen::Bytes(n) => {
                self.check_len(n)?;
                n
            }
            ConsumeLen::Next => state.offsets.write_tail - offset,
        };
        if len == 0 || offset + len > state.offsets.write_tail {
            return Err(RingError::Volatile);
        }
        state.offsets.read_frontier = offset + len;
        state.readers.insert(offset);
        state.check_order();
        trace!("ring: consumed [{}, {})", offset, offset + len);
        Ok(ReadReservation {
            ring: self,
            offset,
            len,
        })
    }

    fn read_done(&self, offset: u64) {
        let mut state = self.state.lock();
        state.readers.remove(&offset);
        let new_tail = state
            .readers
            .first()
            .copied()
            .unwrap_or(state.offsets.read_frontier);
        if new_tail != state.offsets.read_tail {
            debug_assert!(new_tail > state.offsets.read_tail);
            state.offsets.read_tail = new_tail;
            state.check_order();
            self.read_done.notify_all();
        }
    }

    /// Block until the read tail has passed `offset`.
    pub fn flush(&self, offset: u64) -> RingResult<()> {
        let mut state = self.state.lock();
        while state.offsets.read_tail < offset {
            if state.shutdown && state.drained() && state.readers.is_empty() {
                // Nothing will ever move the tail again.
                return Err(RingError::Closed);
            }
            self.read_done.wait(&mut state);
        }
        Ok(())
    }

    pub fn try_flush(&self, offset: u64) -> RingResult<()> {
        if self.state.lock().offsets.read_tail < offset {
            return Err(RingError::WouldBlock(offset));
        }
        Ok(())
    }

    /// Stop accepting reservations. Readers drain what is left, then see
    /// `Closed`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.read_done.notify_all();
        self.write_done.notify_all();
    }

    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.memory.as_ptr())
    }

    fn physical(&self, offset: u64) -> usize {
        (offset & self.mask) as usize
    }

    /// # Safety
    /// The caller must own the window `[offset, offset + len)` exclusively.
    #[allow(clippy::mut_from_ref)]
    unsafe fn window_mut(&self, offset: u64, len: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base_ptr().add(self.physical(offset)), len as usize)
    }

    /// # Safety
    /// No writer may own any byte of `[offset, offset + len)`.
    unsafe fn window(&self, offset: u64, len: u64) -> &[u8] {
        std::slice::from_raw_parts(self.base_ptr().add(self.physical(offset)), len as usize)
    }

    /// Copy a freshly written window into its twin half.
    fn mirror(&self, offset: u64, len: u64) {
        let start = self.physical(offset);
        let end = start + len as usize;
        let cap = self.capacity as usize;
        let base = self.base_ptr();
        // SAFETY: the window is still owned by the finishing writer, and its
        // twin bytes belong to no other live reservation because reservations
        // never cover more than `capacity` bytes between them.
        unsafe {
            let low_end = end.min(cap);
            if start < low_end {
                std::ptr::copy_nonoverlapping(base.add(start), base.add(start + cap), low_end - start);
            }
            if end > cap {
                std::ptr::copy_nonoverlapping(base.add(cap), base, end - cap);
            }
        }
    }
}

/// A writer's exclusive window. Dropping it retires the reservation.
pub struct WriteReservation<'a> {
    ring: &'a RingBuffer,
    offset: u64,
    len: u64,
    padding: u64,
}

impl WriteReservation<'_> {
    /// Logical offset of the first byte of the window, padding included.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of leading zero padding inserted by `reserve_padded`.
    pub fn padding(&self) -> u64 {
        self.padding
    }

    /// Offset of the first byte after the padding.
    pub fn payload_offset(&self) -> u64 {
        self.offset + self.padding
    }

    /// Direct access to a sub-window by logical offset.
    pub fn get_wr_buf(&mut self, offset: u64, len: u64) -> &mut [u8] {
        let start = (offset - self.offset) as usize;
        &mut self[start..start + len as usize]
    }
}

impl Deref for WriteReservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the window belongs to this reservation until it is dropped.
        unsafe { self.ring.window(self.offset, self.len) }
    }
}

impl DerefMut for WriteReservation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the borrow unique.
        unsafe { self.ring.window_mut(self.offset, self.len) }
    }
}

impl Drop for WriteReservation<'_> {
    fn drop(&mut self) {
        self.ring.write_done(self.offset, self.len);
    }
}

/// A reader's claim on a stable span. Dropping it lets the read tail move.
pub struct ReadReservation<'a> {
    ring: &'a RingBuffer,
    offset: u64,
    len: u64,
}

impl ReadReservation<'_> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn get_rd_buf(&self, offset: u64, len: u64) -> &[u8] {
        let start = (offset - self.offset) as usize;
        &self[start..start + len as usize]
    }
}

impl Deref for ReadReservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the span lies below the write tail, so no writer owns it,
        // and the read tail cannot pass it while this claim is alive.
        unsafe { self.ring.window(self.offset, self.len) }
    }
}

impl Drop for ReadReservation<'_> {
    fn drop(&mut self) {
        self.ring.read_done(self.offset);
    }
}
