//! Parked-waiter mutex with an intrusive wait queue packed into one word.
//!
//! # Design
//!
//! The state word packs three things:
//!
//! ```text
//!  63                                  2   1   0
//! ┌──────────────────────────────────┬───────┬────────┐
//! │ head pointer of the waiter list  │ WAKING│ LOCKED │
//! └──────────────────────────────────┴───────┴────────┘
//! ```
//!
//! Waiter nodes live on the stack of the blocked thread. A contender that
//! gives up spinning links its node in front of the head with a CAS and
//! parks on the node's private futex word. The releaser takes the `WAKING`
//! bit as a handoff interlock (at most one thread walks or edits the list
//! at a time), dequeues the *oldest* waiter (approximate FIFO), and signals
//! exactly one node, so a contended unlock never causes a thundering herd.
//!
//! # List discipline
//!
//! The list runs newest → oldest through `next`. A node pushed into an empty
//! queue caches itself in `tail`; later pushes leave `tail` empty. Walkers
//! locate the logical tail at the first node with a non-empty `tail` cache
//! and re-cache it on the current head, so the frontmost cache is always the
//! authoritative one. Nodes are pinned for the duration of their wait: a
//! waiter leaves `lock`/`try_lock_until` only after it is provably unlinked.
//!
//! # Timeout
//!
//! `try_lock_until` parks with a futex timeout. On expiry the waiter takes
//! the `WAKING` interlock and unlinks itself. If it is already gone from the
//! list, a wake is in flight: the waiter consumes it, takes one last shot at
//! the lock, and otherwise reports `TimedOut`; the lock is then held by
//! someone whose unlock will wake the next queued waiter, so no wakeup is
//! lost.
//!
//! Waiters go straight from the bounded spin to the futex park; there is no
//! scheduler yield in between.
//!
//! # Ordering
//!
//! Acquire on every CAS that takes the lock, Release on unlock. Waiter nodes
//! are published by the Release CAS that links them and read under the
//! Acquire that takes the interlock.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crate::futex;

const LOCKED: usize = 1;
const WAKING: usize = 2;
const WAITER_MASK: usize = !(LOCKED | WAKING);

#[cfg(not(loom))]
const SPIN_LIMIT: u32 = 40;
#[cfg(loom)]
const SPIN_LIMIT: u32 = 1;

/// The deadline elapsed before the lock could be acquired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTimeout;

impl std::fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock acquisition timed out")
    }
}

impl std::error::Error for LockTimeout {}

/// Stack-allocated wait-list node. Pointer-packed into the state word, so
/// its alignment must keep the two flag bits free.
#[repr(align(4))]
struct Waiter {
    /// 0 = parked, 1 = wake granted. Each waiter parks on its own word.
    signal: AtomicU32,
    /// Toward older waiters; the oldest node's `next` is null.
    next: Cell<*const Waiter>,
    /// Tail cache; non-null only on nodes that were the head during a walk,
    /// or on a node pushed into an empty queue (pointing at itself).
    tail: Cell<*const Waiter>,
}

/// Result of walking the list from `head` to the logical tail.
struct Walk {
    tail: *const Waiter,
    /// Node in front of `tail`; null when the tail is the head.
    before_tail: *const Waiter,
    /// Node in front of `target`; null when the target is the head.
    before_target: *const Waiter,
    found_target: bool,
}

/// Parked-waiter mutual exclusion around a value.
///
/// # Examples
///
/// ```
/// use stdx::queued_mutex::QueuedMutex;
///
/// let m = QueuedMutex::new(0u32);
/// *m.lock() += 1;
/// assert_eq!(*m.lock(), 1);
/// ```
pub struct QueuedMutex<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for QueuedMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for QueuedMutex<T> {}

impl<T> QueuedMutex<T> {
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex, returning the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> QueuedMutex<T> {
    /// Attempts to acquire without blocking or queuing.
    pub fn try_lock(&self) -> Option<QueuedMutexGuard<'_, T>> {
        if self.try_acquire() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Acquires the lock, parking on contention.
    pub fn lock(&self) -> QueuedMutexGuard<'_, T> {
        if self
            .state
            .compare_exchange_weak(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let acquired = self.lock_slow(None);
            debug_assert!(acquired, "untimed lock cannot fail");
        }
        self.guard()
    }

    /// Acquires the lock or gives up at `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> Result<QueuedMutexGuard<'_, T>, LockTimeout> {
        if self
            .state
            .compare_exchange_weak(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            || self.lock_slow(Some(deadline))
        {
            Ok(self.guard())
        } else {
            Err(LockTimeout)
        }
    }

    /// Acquires the lock or gives up after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<QueuedMutexGuard<'_, T>, LockTimeout> {
        self.try_lock_until(Instant::now() + timeout)
    }

    /// Mutable access without locking; safe because `&mut self` proves
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    fn guard(&self) -> QueuedMutexGuard<'_, T> {
        QueuedMutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Sets the `LOCKED` bit if it is clear, regardless of queue contents.
    fn try_acquire(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Contended acquisition. Returns false only when a deadline was given
    /// and elapsed; the caller is then guaranteed to be unlinked.
    #[cold]
    fn lock_slow(&self, deadline: Option<Instant>) -> bool {
        let waiter = Waiter {
            signal: AtomicU32::new(0),
            next: Cell::new(std::ptr::null()),
            tail: Cell::new(std::ptr::null()),
        };
        debug_assert!((&waiter as *const Waiter as usize) & !WAITER_MASK == 0);

        let mut spins = 0u32;
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED == 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state | LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            // Spin only while the queue is empty; parked waiters mean the
            // hold times are already long.
            if state & WAITER_MASK == 0 && spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                state = self.state.load(Ordering::Relaxed);
                continue;
            }

            // Link ourselves in front of the current head.
            let head = (state & WAITER_MASK) as *const Waiter;
            waiter.signal.store(0, Ordering::Relaxed);
            if head.is_null() {
                waiter.next.set(std::ptr::null());
                waiter.tail.set(&waiter);
            } else {
                waiter.next.set(head);
                waiter.tail.set(std::ptr::null());
            }
            let new_state = (&waiter as *const Waiter as usize) | (state & (LOCKED | WAKING));
            match self.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {}
                Err(actual) => {
                    state = actual;
                    continue;
                }
            }

            if !self.park(&waiter, deadline) {
                // Deadline elapsed while queued.
                if self.cancel_wait(&waiter) {
                    return false;
                }
                // Already dequeued: a wake is in flight. Consume it, then
                // take one final shot. Failing that, the lock is held and
                // that holder's unlock wakes the next waiter, so the
                // consumed permission is not lost, merely declined.
                self.park(&waiter, None);
                return self.try_acquire();
            }

            // Woken: we were dequeued by the releaser; contend again.
            spins = 0;
            state = self.state.load(Ordering::Relaxed);
        }
    }

    /// Parks on the waiter's signal word. Returns false on deadline expiry,
    /// true once the signal is observed.
    fn park(&self, waiter: &Waiter, deadline: Option<Instant>) -> bool {
        loop {
            if waiter.signal.load(Ordering::Acquire) == 1 {
                return true;
            }
            match deadline {
                None => futex::wait(&waiter.signal, 0),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d || !futex::wait_timeout(&waiter.signal, 0, d - now) {
                        return waiter.signal.load(Ordering::Acquire) == 1;
                    }
                }
            }
        }
    }

    /// Takes the `WAKING` interlock and unlinks `target` from the list.
    /// Returns false when the target is no longer queued (a wake is in
    /// flight for it).
    fn cancel_wait(&self, target: &Waiter) -> bool {
        let target = target as *const Waiter;

        // Acquire the interlock; a concurrent releaser may be about to wake
        // us, so the empty-queue observation also means "dequeued".
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & WAITER_MASK == 0 {
                return false;
            }
            if state & WAKING != 0 {
                std::hint::spin_loop();
                state = self.state.load(Ordering::Acquire);
                continue;
            }
            match self.state.compare_exchange_weak(
                state,
                state | WAKING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    state |= WAKING;
                    break;
                }
                Err(actual) => state = actual,
            }
        }

        // Interlock held: the list is stable apart from pushes at the head.
        loop {
            let head = (state & WAITER_MASK) as *const Waiter;
            debug_assert!(!head.is_null());
            // SAFETY: every node reachable from head is pinned while queued;
            // the interlock serializes all list edits.
            let walk = unsafe { Self::walk(head, target) };

            if !walk.found_target {
                self.release_waking();
                return false;
            }

            if target == head {
                // Replace the head. Hand the authoritative tail cache to the
                // new head first so walks stay anchored.
                let next = unsafe { (*target).next.get() };
                if !next.is_null() {
                    unsafe { (*next).tail.set(walk.tail) };
                }
                let new_state = (state & (LOCKED | WAKING)) | (next as usize);
                match self.state.compare_exchange(
                    state,
                    new_state,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.release_waking();
                        return true;
                    }
                    // A new waiter pushed in front of us; re-walk.
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            // Middle or tail node: splice around it and refresh the head
            // cache so no stale cache further down can be trusted by a
            // future walk.
            unsafe {
                let before = walk.before_target;
                debug_assert!(!before.is_null());
                (*before).next.set((*target).next.get());
                let new_tail = if target == walk.tail {
                    before
                } else {
                    walk.tail
                };
                (*head).tail.set(new_tail);
            }
            self.release_waking();
            return true;
        }
    }

    /// Walks from `head` to the logical tail, reporting the tail, the node
    /// before it, and the position of `target` if queued.
    ///
    /// # Safety
    /// Caller must hold the `WAKING` interlock and `head` must be the
    /// current list head.
    unsafe fn walk(head: *const Waiter, target: *const Waiter) -> Walk {
        let mut current = head;
        let mut prev: *const Waiter = std::ptr::null();
        let mut before_target: *const Waiter = std::ptr::null();
        let mut found_target = false;
        // First non-empty cache on the path is the authoritative tail.
        let mut tail: *const Waiter = std::ptr::null();

        loop {
            if current == target {
                found_target = true;
                before_target = prev;
            }
            if tail.is_null() {
                tail = (*current).tail.get();
            }
            if current == tail {
                return Walk {
                    tail,
                    before_tail: prev,
                    before_target,
                    found_target,
                };
            }
            let next = (*current).next.get();
            debug_assert!(!next.is_null(), "walk ran past the logical tail");
            prev = current;
            current = next;
        }
    }

    #[inline]
    fn release_waking(&self) {
        self.state.fetch_and(!WAKING, Ordering::Release);
    }

    fn unlock(&self) {
        if self
            .state
            .compare_exchange(LOCKED, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.unlock_slow();
    }

    #[cold]
    fn unlock_slow(&self) {
        // Release the lock; take the interlock only if there is someone to
        // wake and nobody else is already waking.
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(state & LOCKED != 0, "unlock of unlocked mutex");
            if state & WAITER_MASK == 0 || state & WAKING != 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state & !LOCKED,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(actual) => state = actual,
                }
            } else {
                match self.state.compare_exchange_weak(
                    state,
                    (state & !LOCKED) | WAKING,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        state = (state & !LOCKED) | WAKING;
                        break;
                    }
                    Err(actual) => state = actual,
                }
            }
        }

        // Interlock held. Dequeue the oldest waiter and signal it.
        loop {
            let head = (state & WAITER_MASK) as *const Waiter;
            debug_assert!(!head.is_null());
            // SAFETY: interlock held; queued nodes are pinned.
            let walk = unsafe { Self::walk(head, std::ptr::null()) };

            // If a barger took the lock while we walked, let its unlock do
            // the waking; parking the handoff here avoids a useless wakeup.
            if state & LOCKED != 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state & !WAKING,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            let tail = walk.tail;
            if walk.before_tail.is_null() {
                // The tail is the head: the queue becomes empty. Clearing
                // the pointer and the interlock must be one atomic step, and
                // it fails if a new waiter pushed meanwhile.
                match self.state.compare_exchange_weak(
                    state,
                    state & LOCKED,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {}
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            } else {
                unsafe { (*head).tail.set(walk.before_tail) };
                self.release_waking();
            }

            // SAFETY: the node is pinned at least until it observes the
            // signal, so the pointer is captured before the store; the wake
            // itself goes through the raw address and tolerates the waiter
            // having already left.
            unsafe {
                let signal = &(*tail).signal as *const AtomicU32;
                (*tail).signal.store(1, Ordering::Release);
                futex::wake_one_raw(signal);
            }
            return;
        }
    }
}

impl<T: Default> Default for QueuedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; the lock is released on drop.
pub struct QueuedMutexGuard<'a, T: ?Sized> {
    lock: &'a QueuedMutex<T>,
    /// Guards are tied to the acquiring thread.
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for QueuedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for QueuedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for QueuedMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn uncontended_lock_unlock() {
        let m = QueuedMutex::new(1u32);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 2);
        assert_eq!(m.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = QueuedMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn timeout_expires_while_held() {
        let m = Arc::new(QueuedMutex::new(0u32));
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let waiter = std::thread::spawn(move || {
            m2.lock_timeout(Duration::from_millis(50)).map(|_| ())
        });
        assert_eq!(waiter.join().unwrap(), Err(LockTimeout));
        drop(g);

        // The timed-out waiter must have fully unlinked itself.
        assert!(m.try_lock().is_some());
        assert_eq!(m.state.load(Ordering::Relaxed) & WAITER_MASK, 0);
    }

    #[test]
    fn timeout_succeeds_when_released_in_time() {
        let m = Arc::new(QueuedMutex::new(0u32));
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let waiter = std::thread::spawn(move || {
            let mut g = m2.lock_timeout(Duration::from_secs(5)).unwrap();
            *g += 1;
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(g);
        waiter.join().unwrap();
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn contended_increments_are_exact() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let m = Arc::new(QueuedMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), (THREADS * PER_THREAD) as u64);
        assert_eq!(m.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mixed_timed_and_untimed_waiters() {
        let m = Arc::new(QueuedMutex::new(0u64));
        let mut handles = Vec::new();
        for i in 0..6 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if i % 2 == 0 {
                        *m.lock() += 1;
                    } else {
                        // Generous deadline: these should essentially always
                        // succeed, but exercise the timed enqueue path.
                        match m.lock_timeout(Duration::from_secs(30)) {
                            Ok(mut g) => *g += 1,
                            Err(LockTimeout) => unreachable!("30s deadline expired"),
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 3000);
        assert_eq!(m.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn short_timeouts_under_contention_leave_clean_state() {
        let m = Arc::new(QueuedMutex::new(()));
        let holder = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                let _g = m.lock();
                std::thread::sleep(Duration::from_millis(150));
            })
        };
        std::thread::sleep(Duration::from_millis(10));

        // Several waiters all time out while the holder sleeps.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                m.lock_timeout(Duration::from_millis(30)).map(|_| ())
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), Err(LockTimeout));
        }
        holder.join().unwrap();

        assert!(m.try_lock().is_some());
        assert_eq!(m.state.load(Ordering::Relaxed), 0);
    }
}
