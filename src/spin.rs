//! Busy-wait synchronization helpers and a padded statistics counter.
//!
//! These back the short critical sections where parking would cost more than
//! it saves. For anything that can hold a lock across a syscall or an
//! allocation, use [`crate::mutex::Mutex`] instead.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crossbeam_utils::CachePadded;

/// Test-and-test-and-set spinlock around a value.
///
/// The inner loop reads the flag before retrying the swap, keeping the cache
/// line shared until there is a real chance to acquire.
///
/// # Examples
///
/// ```
/// use stdx::spin::SpinLock;
///
/// let lock = SpinLock::new(0u32);
/// *lock.lock() += 1;
/// assert_eq!(*lock.lock(), 1);
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the flag serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Mutual exclusion on bit 0 of a shared `u32`, leaving bits 1..32 free for
/// caller state.
///
/// Useful when a structure already carries an atomic word and a full lock
/// would double its footprint. The upper bits may only be modified while the
/// lock is held.
pub struct SpinBitLock {
    word: AtomicU32,
}

const SPIN_LOCK_BIT: u32 = 1;

impl SpinBitLock {
    /// # Panics
    /// Panics if `initial` has bit 0 set.
    pub fn new(initial: u32) -> Self {
        assert!(initial & SPIN_LOCK_BIT == 0, "bit 0 is the lock bit");
        Self {
            word: AtomicU32::new(initial),
        }
    }

    /// Spins until the lock bit is acquired.
    #[inline]
    pub fn lock(&self) {
        while self.word.fetch_or(SPIN_LOCK_BIT, Ordering::Acquire) & SPIN_LOCK_BIT != 0 {
            while self.word.load(Ordering::Relaxed) & SPIN_LOCK_BIT != 0 {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.word.fetch_or(SPIN_LOCK_BIT, Ordering::Acquire) & SPIN_LOCK_BIT == 0
    }

    /// Releases the lock bit, leaving the payload bits untouched.
    ///
    /// Must only be called by the lock holder.
    #[inline]
    pub fn unlock(&self) {
        self.word.fetch_and(!SPIN_LOCK_BIT, Ordering::Release);
    }

    /// Snapshot of the payload bits (shifted down past the lock bit).
    #[inline]
    pub fn payload(&self) -> u32 {
        self.word.load(Ordering::Acquire) >> 1
    }

    /// Stores the payload bits. Must only be called by the lock holder.
    #[inline]
    pub fn set_payload(&self, payload: u32) {
        debug_assert!(payload <= u32::MAX >> 1, "payload overflows 31 bits");
        self.word
            .store((payload << 1) | SPIN_LOCK_BIT, Ordering::Release);
    }
}

/// Cache-padded monotonically increasing counter for cheap cross-thread
/// statistics.
///
/// All operations are `Relaxed`: counts are eventually consistent and carry
/// no synchronization obligations.
pub struct AtomicCounter {
    value: CachePadded<AtomicU64>,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Adds one; returns the previous value.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `n`; returns the previous value.
    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::Relaxed)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_guards_value() {
        let lock = SpinLock::new(3u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 4);
    }

    #[test]
    fn spin_lock_try_lock_contended() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn spin_lock_contended_counting() {
        let per_thread = crate::test_utils::stress_ops(10_000);
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..per_thread {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4 * per_thread);
    }

    #[test]
    fn bit_lock_preserves_payload() {
        let lock = SpinBitLock::new(42 << 1);
        assert_eq!(lock.payload(), 42);

        lock.lock();
        lock.set_payload(7);
        lock.unlock();

        assert_eq!(lock.payload(), 7);
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "bit 0 is the lock bit")]
    fn bit_lock_rejects_locked_initial() {
        let _ = SpinBitLock::new(1);
    }

    #[test]
    fn counter_accumulates_across_threads() {
        let counter = Arc::new(AtomicCounter::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.increment();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 4000);
        counter.add(5);
        assert_eq!(counter.get(), 4005);
    }
}
