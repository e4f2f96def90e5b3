//! Wait-free SPSC (Single-Producer, Single-Consumer) bounded queue.
//!
//! # Design
//!
//! Classical Lamport ring: `capacity + 1` slots so full and empty are
//! unambiguous (`empty` iff the indices are equal, `full` iff the next write
//! index equals the read index). Indices always hold values in
//! `[0, capacity + 1)`; the wrap is computed when deriving the *next* index,
//! never on the atomic itself.
//!
//! # Key properties
//!
//! - **Wait-free**: every operation completes in bounded steps regardless of
//!   the peer thread's scheduling.
//! - **No CAS**: only `Acquire`/`Release` loads and stores. On x86-64 TSO
//!   these compile to plain `MOV`.
//! - **Cached remote index**: the producer caches the consumer's `read_index`
//!   and only reloads it on apparent-full; the consumer caches `write_index`
//!   and reloads on apparent-empty. This keeps the peer's cache line out of
//!   the hot path.
//! - **Cache-line padded**: the two indices live on separate cache lines.
//! - **Batch transfers**: `push_many`/`pop_many` refresh the remote index
//!   once and publish a single index store for the whole batch.
//!
//! # Ordering rationale
//!
//! ```text
//! Producer writes slot, then Release-stores write_index
//!     →  consumer Acquire-loads write_index, then reads slot
//! Consumer reads slot, then Release-stores read_index
//!     →  producer Acquire-loads read_index, then reuses slot
//! ```
//!
//! # Safety
//!
//! Slot storage is `UnsafeCell<MaybeUninit<T>>`. Slots in the logical range
//! `[read_index, write_index)` are initialized; the index protocol keeps
//! producer and consumer on disjoint slots. The split handles borrow the
//! queue mutably, so exactly one producer and one consumer can exist at a
//! time; `reset` needs `&mut self` and therefore cannot race anything.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

/// Bounded wait-free SPSC queue.
///
/// Split into a [`Producer`] and [`Consumer`] before use:
///
/// ```
/// use stdx::spsc::SpscQueue;
///
/// let mut q: SpscQueue<u64> = SpscQueue::new(2);
/// let (mut tx, mut rx) = q.split();
/// assert!(tx.push(1).is_ok());
/// assert!(tx.push(2).is_ok());
/// assert_eq!(tx.push(3), Err(3));
/// assert_eq!(rx.pop(), Some(1));
/// ```
pub struct SpscQueue<T> {
    /// `capacity + 1` slots.
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Consumer's index; producer reads it (Acquire) to detect space.
    read_index: CachePadded<AtomicUsize>,
    /// Producer's index; consumer reads it (Acquire) to detect data.
    write_index: CachePadded<AtomicUsize>,
}

// SAFETY: the index protocol keeps the two sides on disjoint slots, and the
// split handles enforce a single producer and a single consumer.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Constructs a queue holding up to `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SpscQueue capacity must be > 0");
        assert!(
            capacity < usize::MAX,
            "SpscQueue capacity leaves no room for the sentinel slot"
        );

        let mut buf = Vec::with_capacity(capacity + 1);
        for _ in 0..capacity + 1 {
            buf.push(UnsafeCell::new(MaybeUninit::uninit()));
        }

        Self {
            buf: buf.into_boxed_slice(),
            read_index: CachePadded::new(AtomicUsize::new(0)),
            write_index: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum number of stored elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    /// Index following `i` in the ring of `capacity + 1` slots.
    #[inline]
    fn next_index(&self, i: usize) -> usize {
        let next = i + 1;
        if next == self.buf.len() {
            0
        } else {
            next
        }
    }

    /// Number of initialized slots for a given index snapshot.
    #[inline]
    fn occupied(&self, read: usize, write: usize) -> usize {
        if write >= read {
            write - read
        } else {
            write + self.buf.len() - read
        }
    }

    /// Approximate emptiness check; exact only while one side is quiescent.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index.load(Ordering::Acquire) == self.write_index.load(Ordering::Acquire)
    }

    /// Splits the queue into its producer and consumer halves.
    ///
    /// The `&mut` borrow guarantees no other handles exist while these live.
    /// The caches must start from genuine index snapshots: a handle seeded
    /// with a value its peer has already wrapped past would defeat the
    /// full/empty checks.
    pub fn split(&mut self) -> (Producer<'_, T>, Consumer<'_, T>) {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);
        let this = &*self;
        (
            Producer {
                queue: this,
                cached_read: read,
            },
            Consumer {
                queue: this,
                cached_write: write,
            },
        )
    }

    /// Drops all stored elements and rewinds both indices.
    ///
    /// Not thread-safe by construction: requires exclusive access.
    pub fn reset(&mut self) {
        self.drain_slots();
        #[cfg(not(loom))]
        {
            *self.read_index.get_mut() = 0;
            *self.write_index.get_mut() = 0;
        }
        #[cfg(loom)]
        {
            self.read_index.store(0, Ordering::Relaxed);
            self.write_index.store(0, Ordering::Relaxed);
        }
    }

    fn drain_slots(&mut self) {
        let mut read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);
        while read != write {
            // SAFETY: slots in [read, write) are initialized.
            unsafe { (*self.buf[read].get()).assume_init_drop() };
            read = self.next_index(read);
        }
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        self.drain_slots();
    }
}

/// Producer half of an [`SpscQueue`]. At most one exists per queue.
pub struct Producer<'a, T> {
    queue: &'a SpscQueue<T>,
    /// Snapshot of the consumer's `read_index`, refreshed only when the
    /// queue appears full.
    cached_read: usize,
}

// SAFETY: moving the producer to another thread is fine; `&mut self` methods
// keep it single-threaded at any instant.
unsafe impl<T: Send> Send for Producer<'_, T> {}

impl<T> Producer<'_, T> {
    /// Attempts to push `value`.
    ///
    /// Fails iff the consumer has not yet advanced past the slot this write
    /// needs, returning the value to the caller.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let write = self.queue.write_index.load(Ordering::Relaxed);
        let next = self.queue.next_index(write);

        if next == self.cached_read {
            self.cached_read = self.queue.read_index.load(Ordering::Acquire);
            if next == self.cached_read {
                return Err(value);
            }
        }

        // SAFETY: `write` is outside [read, write): free for the producer.
        unsafe { (*self.queue.buf[write].get()).write(value) };
        self.queue.write_index.store(next, Ordering::Release);
        Ok(())
    }

    /// Pushes as many elements of `values` as capacity allows; returns the
    /// number written.
    ///
    /// Refreshes the consumer index once and publishes one index store for
    /// the whole batch.
    pub fn push_many(&mut self, values: &[T]) -> usize
    where
        T: Copy,
    {
        if values.is_empty() {
            return 0;
        }

        let available = self.write_available();
        let count = available.min(values.len());
        let mut write = self.queue.write_index.load(Ordering::Relaxed);
        for &value in &values[..count] {
            // SAFETY: `count <= available` keeps every slot outside the
            // initialized range.
            unsafe { (*self.queue.buf[write].get()).write(value) };
            write = self.queue.next_index(write);
        }
        self.queue.write_index.store(write, Ordering::Release);
        count
    }

    /// Number of elements that can be pushed before the queue is full.
    ///
    /// Refreshes the cached consumer index; the result can only grow by the
    /// time a push happens.
    pub fn write_available(&mut self) -> usize {
        self.cached_read = self.queue.read_index.load(Ordering::Acquire);
        let write = self.queue.write_index.load(Ordering::Relaxed);
        self.queue.capacity() - self.queue.occupied(self.cached_read, write)
    }
}

/// Consumer half of an [`SpscQueue`]. At most one exists per queue.
pub struct Consumer<'a, T> {
    queue: &'a SpscQueue<T>,
    /// Snapshot of the producer's `write_index`, refreshed only when the
    /// queue appears empty.
    cached_write: usize,
}

// SAFETY: same single-threaded-at-any-instant argument as the producer.
unsafe impl<T: Send> Send for Consumer<'_, T> {}

impl<T> Consumer<'_, T> {
    /// Attempts to pop the oldest element.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let read = self.queue.read_index.load(Ordering::Relaxed);

        if read == self.cached_write {
            self.cached_write = self.queue.write_index.load(Ordering::Acquire);
            if read == self.cached_write {
                return None;
            }
        }

        // SAFETY: `read != write` proves the slot is initialized.
        let value = unsafe { (*self.queue.buf[read].get()).assume_init_read() };
        self.queue
            .read_index
            .store(self.queue.next_index(read), Ordering::Release);
        Some(value)
    }

    /// Borrows the oldest element without removing it, or `None` when empty.
    ///
    /// The slot stays untouchable by the producer until `read_index`
    /// advances, so the borrow is stable for its lifetime.
    pub fn peek(&mut self) -> Option<&T> {
        let read = self.queue.read_index.load(Ordering::Relaxed);

        if read == self.cached_write {
            self.cached_write = self.queue.write_index.load(Ordering::Acquire);
            if read == self.cached_write {
                return None;
            }
        }

        // SAFETY: slot is initialized and cannot be overwritten while
        // read_index stays put, which this borrow of `self` guarantees.
        Some(unsafe { (*self.queue.buf[read].get()).assume_init_ref() })
    }

    /// Pops up to `out.len()` elements in one batch; returns the count.
    ///
    /// Values are written into `out[..n]`. The output uses `MaybeUninit` so
    /// callers do not need `T: Default`; only the first `n` elements may be
    /// assumed initialized.
    pub fn pop_many(&mut self, out: &mut [MaybeUninit<T>]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let available = self.read_available();
        let count = available.min(out.len());
        let mut read = self.queue.read_index.load(Ordering::Relaxed);
        for slot_out in &mut out[..count] {
            // SAFETY: `count <= available` keeps every slot inside the
            // initialized range.
            let value = unsafe { (*self.queue.buf[read].get()).assume_init_read() };
            *slot_out = MaybeUninit::new(value);
            read = self.queue.next_index(read);
        }
        self.queue.read_index.store(read, Ordering::Release);
        count
    }

    /// Number of elements ready to pop.
    ///
    /// Refreshes the cached producer index; the result can only grow by the
    /// time a pop happens.
    pub fn read_available(&mut self) -> usize {
        self.cached_write = self.queue.write_index.load(Ordering::Acquire);
        let read = self.queue.read_index.load(Ordering::Relaxed);
        self.queue.occupied(read, self.cached_write)
    }

    /// Approximate emptiness check from the consumer side.
    #[inline]
    pub fn is_empty(&mut self) -> bool {
        self.read_available() == 0
    }
}
