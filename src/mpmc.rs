//! Bounded lock-free MPMC queue with per-slot turn counters.
//!
//! # Design
//!
//! Two monotonically increasing 64-bit tickets, `head` for producers and
//! `tail` for consumers, are claimed with `fetch_add`. A ticket `t` maps to
//! slot `t % capacity` and generation `t / capacity`. Each slot carries a
//! `turn` counter that alternates even/odd:
//!
//! ```text
//! turn == 2 * gen      slot free for the producer of generation `gen`
//! turn == 2 * gen + 1  slot holds the value for the consumer of `gen`
//! ```
//!
//! A producer spins until its slot's turn reaches `2 * gen`, writes, then
//! publishes with `2 * gen + 1`. A consumer spins until `2 * gen + 1`, reads,
//! then frees the slot for the next generation with `2 * gen + 2`. Ticket
//! order is a total order on successful operations; a slow producer delays
//! only its own slot, not the rest of the queue.
//!
//! The non-blocking variants inspect the slot turn first and only then
//! CAS-commit the ticket, so a failed `try_enqueue`/`try_dequeue` never
//! claims a ticket it cannot complete.
//!
//! # Ordering
//!
//! The value write happens-before the matching read via the Release store /
//! Acquire load pairing on the slot's `turn`. Ticket counters themselves only
//! need atomicity (Relaxed `fetch_add`); all synchronization flows through
//! the slots.
//!
//! # Invariants
//! - `capacity > 0`; elements must not be zero-sized (checked at compile
//!   time per instantiation).
//! - Every slot is cache-line padded so neighboring slots never share a line.
//!
//! # Safety
//! Slot storage is `UnsafeCell<MaybeUninit<T>>`. A slot is written only by
//! the producer holding its ticket and read only by the consumer holding the
//! matching ticket; the turn protocol makes those accesses disjoint.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

struct Slot<T> {
    turn: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC FIFO for any number of concurrent producers and consumers.
///
/// # Examples
///
/// ```
/// use stdx::mpmc::MpmcQueue;
///
/// let q: MpmcQueue<u64> = MpmcQueue::new(4);
/// q.enqueue(1);
/// assert_eq!(q.try_dequeue(), Some(1));
/// assert_eq!(q.try_dequeue(), None);
/// ```
pub struct MpmcQueue<T> {
    /// Next producer ticket.
    head: CachePadded<AtomicU64>,
    /// Next consumer ticket.
    tail: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<Slot<T>>]>,
    capacity: u64,
}

// SAFETY: slots are handed off between threads through the turn protocol;
// a value is only ever owned by one side at a time.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    // Zero-sized elements would make every slot alias; there is nothing to
    // hand off. Evaluated per instantiation.
    const ELEM_NOT_ZST: () = assert!(
        std::mem::size_of::<T>() != 0,
        "MpmcQueue elements must not be zero-sized"
    );

    /// Constructs a queue with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        let _ = Self::ELEM_NOT_ZST;
        assert!(capacity > 0, "MpmcQueue capacity must be > 0");
        assert!(capacity <= u32::MAX as usize, "MpmcQueue capacity too large");

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(CachePadded::new(Slot {
                turn: AtomicU64::new(0),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            }));
        }

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: slots.into_boxed_slice(),
            capacity: capacity as u64,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Approximate number of queued elements.
    ///
    /// Exact only at quiescent moments; concurrent operations may skew the
    /// snapshot in either direction.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.capacity) as usize
    }

    /// Approximate emptiness check; see [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, ticket: u64) -> &Slot<T> {
        let idx = (ticket % self.capacity) as usize;
        debug_assert!(idx < self.slots.len());
        &self.slots[idx]
    }

    /// Turn value marking a slot free for the producer of `ticket`.
    #[inline]
    fn produce_turn(&self, ticket: u64) -> u64 {
        (ticket / self.capacity) * 2
    }

    /// Blocking enqueue. Always succeeds once the slot's previous consumer
    /// has freed it.
    pub fn enqueue(&self, value: T) {
        let ticket = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(ticket);
        let turn = self.produce_turn(ticket);

        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }

        // SAFETY: the turn match proves the consumer of the previous
        // generation is done with this slot and no other producer holds
        // this ticket.
        unsafe { (*slot.data.get()).write(value) };
        slot.turn.store(turn + 1, Ordering::Release);
    }

    /// Non-blocking enqueue. Returns `Err(value)` when the queue appeared
    /// full at the observation point.
    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        let mut ticket = self.head.load(Ordering::Acquire);
        loop {
            let slot = self.slot(ticket);
            let turn = self.produce_turn(ticket);
            if slot.turn.load(Ordering::Acquire) == turn {
                // Slot is free for this generation; commit the ticket.
                match self.head.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: ticket committed, slot free (turn matched).
                        unsafe { (*slot.data.get()).write(value) };
                        slot.turn.store(turn + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => ticket = actual,
                }
            } else {
                // Either the queue is full at this ticket or another
                // producer raced past us. Distinguish by re-reading head:
                // an unchanged head means nobody advanced, so the slot is
                // still held by a lagging consumer and the queue is full.
                let prev = ticket;
                ticket = self.head.load(Ordering::Acquire);
                if ticket == prev {
                    return Err(value);
                }
            }
        }
    }

    /// Blocking dequeue. Returns once an element is available at this
    /// caller's ticket.
    pub fn dequeue(&self) -> T {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(ticket);
        let turn = self.produce_turn(ticket) + 1;

        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }

        // SAFETY: the turn match proves the producer published this ticket's
        // value and no other consumer holds this ticket.
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.turn.store(turn + 1, Ordering::Release);
        value
    }

    /// Non-blocking dequeue. Returns `None` when the queue appeared empty at
    /// the observation point.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut ticket = self.tail.load(Ordering::Acquire);
        loop {
            let slot = self.slot(ticket);
            let turn = self.produce_turn(ticket) + 1;
            if slot.turn.load(Ordering::Acquire) == turn {
                match self.tail.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: ticket committed, value published.
                        let value = unsafe { (*slot.data.get()).assume_init_read() };
                        slot.turn.store(turn + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => ticket = actual,
                }
            } else {
                let prev = ticket;
                ticket = self.tail.load(Ordering::Acquire);
                if ticket == prev {
                    return None;
                }
            }
        }
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // No concurrent users at drop time; drain what the consumers left.
        while self.try_dequeue().is_some() {}
    }
}


#[cfg(all(test, feature = "stdx-proptest", not(loom)))]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    const PROPTEST_CASES: u32 = 16;

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u64),
        Dequeue,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u64>().prop_map(Op::Enqueue), Just(Op::Dequeue)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            crate::test_utils::proptest_cases(PROPTEST_CASES)
        ))]

        /// Single-threaded op sequences match a VecDeque model.
        #[test]
        fn matches_model(
            cap in 1usize..9,
            ops in proptest::collection::vec(op_strategy(), 0..400),
        ) {
            let q: MpmcQueue<u64> = MpmcQueue::new(cap);
            let mut model: VecDeque<u64> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Enqueue(v) => {
                        let res = q.try_enqueue(v);
                        if model.len() == cap {
                            prop_assert_eq!(res, Err(v));
                        } else {
                            prop_assert!(res.is_ok());
                            model.push_back(v);
                        }
                    }
                    Op::Dequeue => {
                        prop_assert_eq!(q.try_dequeue(), model.pop_front());
                    }
                }
                prop_assert_eq!(q.len(), model.len());
                prop_assert_eq!(q.is_empty(), model.is_empty());
            }
        }
    }
}
