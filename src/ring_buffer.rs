//! Lock-free overwriting ring buffer with cursor-based reads.
//!
//! # Design
//!
//! Writers claim a global 64-bit ticket with `fetch_add` and never wait for
//! readers: once the ring is full they overwrite the oldest cell. Readers
//! hold a [`Cursor`] (a ticket snapshot) and race the writers; a read either
//! returns the value written at exactly that ticket or reports a miss.
//!
//! Each cell runs a small sequencer state machine, with
//! `slot_turn = ticket / capacity`:
//!
//! ```text
//! seq == slot_turn * 2            cell free at this generation
//! seq == slot_turn * 2 + 1        write in progress
//! seq == (slot_turn + 1) * 2      published at this generation
//! ```
//!
//! A reader for ticket `t` requires `seq == (t / capacity + 1) * 2` both
//! before and after copying the cell. A changed sequencer means the copy may
//! interleave two writers' bytes, so the read is discarded as a miss. This is
//! the only defense against torn reads, which is why elements must be `Copy`:
//! the copy is a plain byte copy and nothing (no destructor, no validation)
//! touches it before the second check passes.
//!
//! # Ordering
//!
//! A successful read at cursor `c` observes the write whose ticket equals `c`
//! and everything the writer released before publishing, via the Acquire load
//! of the publish value stored with Release.
//!
//! # Invariants
//! - `capacity > 0`.
//! - The sequencer is `u32`; it wraps only after `2^31` laps of a single
//!   cell, which is unreachable in practice for a 64-bit ticket space.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

/// Opaque, monotonically increasing ticket identifying a cell + generation.
///
/// Cursor arithmetic saturates at both ends of the `u64` range; the movers
/// report whether the position actually changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    ticket: u64,
}

impl Cursor {
    /// Raw ticket value; equal tickets identify the same write.
    #[inline]
    pub fn ticket(self) -> u64 {
        self.ticket
    }

    /// Advances by `n` tickets, saturating. Returns true if the cursor moved.
    #[inline]
    pub fn move_forward(&mut self, n: u64) -> bool {
        let old = self.ticket;
        self.ticket = self.ticket.saturating_add(n);
        self.ticket != old
    }

    /// Rewinds by `n` tickets, saturating at zero. Returns true if the
    /// cursor moved.
    #[inline]
    pub fn move_backward(&mut self, n: u64) -> bool {
        let old = self.ticket;
        self.ticket = self.ticket.saturating_sub(n);
        self.ticket != old
    }
}

struct Cell<T> {
    seq: AtomicU32,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded overwriting buffer allowing many writers and many racing readers.
///
/// # Examples
///
/// ```
/// use stdx::ring_buffer::LockFreeRingBuffer;
///
/// let ring: LockFreeRingBuffer<u64> = LockFreeRingBuffer::new(4);
/// let cursor = ring.write_and_cursor(42);
/// assert_eq!(ring.try_read(cursor), Some(42));
/// ```
pub struct LockFreeRingBuffer<T> {
    ticket: CachePadded<AtomicU64>,
    cells: Box<[CachePadded<Cell<T>>]>,
    capacity: u64,
}

// SAFETY: cell data is only observed through the sequencer protocol; torn
// copies are discarded before anything reads them, and T: Copy means no
// destructor can run on torn bytes.
unsafe impl<T: Copy + Send> Send for LockFreeRingBuffer<T> {}
unsafe impl<T: Copy + Send> Sync for LockFreeRingBuffer<T> {}

impl<T: Copy> LockFreeRingBuffer<T> {
    /// Constructs a ring with `capacity` cells.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LockFreeRingBuffer capacity must be > 0");
        assert!(
            capacity <= u32::MAX as usize,
            "LockFreeRingBuffer capacity too large"
        );

        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(CachePadded::new(Cell {
                seq: AtomicU32::new(0),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            }));
        }

        Self {
            ticket: CachePadded::new(AtomicU64::new(0)),
            cells: cells.into_boxed_slice(),
            capacity: capacity as u64,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    fn cell(&self, ticket: u64) -> &Cell<T> {
        &self.cells[(ticket % self.capacity) as usize]
    }

    #[inline]
    fn slot_turn(&self, ticket: u64) -> u32 {
        (ticket / self.capacity) as u32
    }

    /// Sequencer value at which the write for `ticket` is published.
    #[inline]
    fn published_seq(&self, ticket: u64) -> u32 {
        (self.slot_turn(ticket) + 1) * 2
    }

    /// Publishes `value`, advancing the global ticket.
    #[inline]
    pub fn write(&self, value: T) {
        let _ = self.write_and_cursor(value);
    }

    /// Publishes `value` and returns the cursor identifying this write.
    ///
    /// Never blocks on readers; waits only for the previous writer of the
    /// same cell to finish publishing, which is guaranteed to happen.
    pub fn write_and_cursor(&self, value: T) -> Cursor {
        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
        let cell = self.cell(ticket);
        let turn = self.slot_turn(ticket);

        while cell.seq.load(Ordering::Acquire) != turn * 2 {
            std::hint::spin_loop();
        }

        // Mark the cell as mid-write so racing readers discard their copies.
        cell.seq.store(turn * 2 + 1, Ordering::Release);
        // SAFETY: the sequencer handshake gives this writer exclusive write
        // access to the cell until it publishes below.
        unsafe { (*cell.data.get()).write(value) };
        cell.seq.store((turn + 1) * 2, Ordering::Release);

        Cursor { ticket }
    }

    /// Attempts to copy the value written at `cursor`.
    ///
    /// Returns `None` when the cell is not currently published at the
    /// cursor's generation: not yet written, mid-write, or already lapped by
    /// newer writes.
    pub fn try_read(&self, cursor: Cursor) -> Option<T> {
        let cell = self.cell(cursor.ticket);
        let expected = self.published_seq(cursor.ticket);

        if cell.seq.load(Ordering::Acquire) != expected {
            return None;
        }
        // SAFETY: copying possibly-racing bytes into a MaybeUninit is a plain
        // byte copy; the value is only blessed after the re-check below.
        let copied: MaybeUninit<T> = unsafe { std::ptr::read(cell.data.get()) };
        if cell.seq.load(Ordering::Acquire) != expected {
            // Torn: a writer advanced the cell while we copied.
            return None;
        }
        // SAFETY: both checks saw the published generation, so the copy is
        // exactly the bytes written at `cursor`.
        Some(unsafe { copied.assume_init() })
    }

    /// Spins until the cell reaches the cursor's published generation, then
    /// attempts the read.
    ///
    /// Still returns `None` when the wait overshoots: a burst of writers can
    /// lap the cursor between the wait and the copy.
    pub fn wait_and_try_read(&self, cursor: Cursor) -> Option<T> {
        let cell = self.cell(cursor.ticket);
        let expected = self.published_seq(cursor.ticket);

        while cell.seq.load(Ordering::Acquire) < expected {
            std::hint::spin_loop();
        }
        self.try_read(cursor)
    }

    /// Cursor one past the latest write.
    #[inline]
    pub fn current_head(&self) -> Cursor {
        Cursor {
            ticket: self.ticket.load(Ordering::Acquire),
        }
    }

    /// Oldest cursor that can still be live, `head - capacity` saturated
    /// at zero.
    #[inline]
    pub fn current_tail(&self) -> Cursor {
        Cursor {
            ticket: self
                .ticket
                .load(Ordering::Acquire)
                .saturating_sub(self.capacity),
        }
    }
}



#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// One writer laps a capacity-1 ring while a reader races `try_read`;
    /// every successful read must be one of the written values, never a mix.
    #[test]
    fn loom_reader_races_overwrites() {
        loom::model(|| {
            let ring = loom::sync::Arc::new(LockFreeRingBuffer::<u64>::new(1));

            let writer = {
                let ring = ring.clone();
                thread::spawn(move || {
                    ring.write(7);
                    ring.write(11);
                })
            };

            let reader = {
                let ring = ring.clone();
                thread::spawn(move || {
                    let c = Cursor { ticket: 0 };
                    if let Some(v) = ring.try_read(c) {
                        assert_eq!(v, 7);
                    }
                })
            };

            writer.join().unwrap();
            reader.join().unwrap();
        });
    }
}
