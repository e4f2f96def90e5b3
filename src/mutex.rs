//! Compact three-state futex mutex.
//!
//! # Design
//!
//! The entire lock is one `AtomicU32`:
//!
//! ```text
//! UNLOCKED  = 0   nobody holds the lock
//! LOCKED    = 1   held, no sleeping waiters
//! CONTENDED = 3   held, at least one thread may be parked
//! ```
//!
//! `try_lock` is a single atomic bit-set of bit 0 (`lock bts` on x86): the
//! previous value was `UNLOCKED` iff the caller acquired, and the operation
//! leaves `LOCKED`/`CONTENDED` states untouched. The slow path spins a small
//! bounded number of times while the lock looks merely `LOCKED`, then swaps
//! the state to `CONTENDED` and futex-waits on it. Unlock swaps to
//! `UNLOCKED` and wakes one waiter only when the previous state was
//! `CONTENDED`, so uncontended unlocks never enter the kernel.
//!
//! The `CONTENDED` swap deliberately over-approximates: a woken waiter
//! re-marks the lock contended even if it was the last sleeper, which costs
//! at most one spurious wake. Deadlock-free; not starvation-free.
//!
//! # Ordering
//!
//! Acquire on every transition that can take the lock, Release on unlock;
//! the critical section is therefore ordered by the state word alone.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::futex;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 3;

/// Bounded spin before parking; roughly one cache-miss round trip per
/// iteration on contemporary hardware.
#[cfg(not(loom))]
const SPIN_LIMIT: u32 = 50;
#[cfg(loom)]
const SPIN_LIMIT: u32 = 1;

/// Futex-backed mutual exclusion around a value.
///
/// # Examples
///
/// ```
/// use stdx::mutex::Mutex;
///
/// let m = Mutex::new(0u32);
/// *m.lock() += 1;
/// assert_eq!(*m.lock(), 1);
/// ```
pub struct Mutex<T: ?Sized> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex, returning the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Attempts to acquire without blocking.
    ///
    /// A single atomic OR of bit 0: setting it on `UNLOCKED` acquires, and
    /// leaves `LOCKED`/`CONTENDED` unchanged (bit 0 is already set in both).
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.state.fetch_or(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Acquires the lock, parking after a bounded spin.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if self.state.fetch_or(LOCKED, Ordering::Acquire) != UNLOCKED {
            self.lock_slow();
        }
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            match self.state.load(Ordering::Relaxed) {
                UNLOCKED => {
                    if self.state.fetch_or(LOCKED, Ordering::Acquire) == UNLOCKED {
                        return;
                    }
                }
                LOCKED => {}
                // CONTENDED: waiters are already parked; spinning past them
                // buys nothing.
                _ => break,
            }
            std::hint::spin_loop();
            spins += 1;
        }

        loop {
            // Swap, not CAS: on the UNLOCKED -> CONTENDED transition we both
            // acquire the lock and keep the contended marking, which makes
            // the eventual unlock wake the next sleeper.
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            futex::wait(&self.state, CONTENDED);
        }
    }

    #[inline]
    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex::wake_one(&self.state);
        }
    }

    /// Mutable access without locking; safe because `&mut self` proves
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; the lock is released on drop, so an unlock without a prior
/// lock is unrepresentable.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    /// Guards are tied to the acquiring thread.
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
