//! Thin wait/wake wrappers over the kernel futex facility.
//!
//! # Contract
//! - [`wait`] blocks the caller while `atomic` still holds `expected`, and may
//!   return spuriously at any time. Callers must re-check their predicate in a
//!   loop; that loop is part of every futex protocol, not an optimization.
//! - [`wait_timeout`] additionally returns `false` once `timeout` elapses.
//! - [`wake_one`] / [`wake_all`] wake threads blocked in [`wait`] on the same
//!   word. Waking with no waiters is a no-op.
//!
//! # Platforms
//! On Linux this is the `SYS_futex` syscall with `FUTEX_PRIVATE_FLAG` (the
//! words are never shared across address spaces). Elsewhere the wait degrades
//! to bounded spinning plus a scheduler yield, which satisfies the contract
//! above because spurious returns are always allowed; wakes become no-ops.

#[cfg(not(loom))]
use std::sync::atomic::AtomicU32;

#[cfg(loom)]
use loom::sync::atomic::AtomicU32;

use std::time::Duration;

/// Block while `*atomic == expected`, with spurious wakeups allowed.
#[cfg(all(target_os = "linux", not(loom)))]
#[inline]
pub fn wait(atomic: &AtomicU32, expected: u32) {
    let ptr = atomic as *const AtomicU32 as *const u32;
    // EAGAIN (value changed first), EINTR, and plain wakeups are all
    // indistinguishable to the caller; every exit is a "re-check" signal.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            ptr,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

/// Block while `*atomic == expected`, for at most `timeout`.
///
/// Returns `false` if the timeout elapsed, `true` for every other exit
/// (wakeup, value change, spurious return).
#[cfg(all(target_os = "linux", not(loom)))]
pub fn wait_timeout(atomic: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    let ptr = atomic as *const AtomicU32 as *const u32;
    let ts = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as _,
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            ptr,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            &ts,
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        return err.raw_os_error() != Some(libc::ETIMEDOUT);
    }
    true
}

/// Wake at most one thread blocked on `atomic`.
#[cfg(all(target_os = "linux", not(loom)))]
#[inline]
pub fn wake_one(atomic: &AtomicU32) {
    let ptr = atomic as *const AtomicU32 as *const u32;
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            ptr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

/// Wake at most one thread blocked on the word at `ptr`.
///
/// For wakers that cannot prove the word is still live: the kernel treats
/// the address purely as a lookup key and never touches the memory, so a
/// stale address wakes nobody. Callers must have captured `ptr` while the
/// word was still valid.
#[cfg(all(target_os = "linux", not(loom)))]
#[inline]
pub(crate) fn wake_one_raw(ptr: *const AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            ptr as *const u32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

/// Wake every thread blocked on `atomic`.
#[cfg(all(target_os = "linux", not(loom)))]
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    let ptr = atomic as *const AtomicU32 as *const u32;
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            ptr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}

// Portable fallback: bounded spin then yield. Correct under the spurious-
// return contract; callers loop on their predicate regardless of platform.

#[cfg(any(not(target_os = "linux"), loom))]
const FALLBACK_SPINS: u32 = 64;

#[cfg(any(not(target_os = "linux"), loom))]
pub fn wait(atomic: &AtomicU32, expected: u32) {
    use std::sync::atomic::Ordering;
    for _ in 0..FALLBACK_SPINS {
        if atomic.load(Ordering::Acquire) != expected {
            return;
        }
        #[cfg(loom)]
        loom::thread::yield_now();
        #[cfg(not(loom))]
        std::hint::spin_loop();
    }
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(not(loom))]
    std::thread::yield_now();
}

#[cfg(any(not(target_os = "linux"), loom))]
pub fn wait_timeout(atomic: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    use std::sync::atomic::Ordering;
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if atomic.load(Ordering::Acquire) != expected {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
}

#[cfg(any(not(target_os = "linux"), loom))]
#[inline]
pub fn wake_one(_atomic: &AtomicU32) {}

#[cfg(any(not(target_os = "linux"), loom))]
#[inline]
pub(crate) fn wake_one_raw(_ptr: *const AtomicU32) {}

#[cfg(any(not(target_os = "linux"), loom))]
#[inline]
pub fn wake_all(_atomic: &AtomicU32) {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        // Expected value does not match: the kernel returns EAGAIN immediately.
        wait(&word, 0);
    }

    #[test]
    fn wait_timeout_expires() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        let woken = wait_timeout(&word, 7, Duration::from_millis(50));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wake_unblocks_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = Arc::clone(&word);

        let waiter = std::thread::spawn(move || {
            while w.load(Ordering::Acquire) == 0 {
                wait(&w, 0);
            }
        });

        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_one(&word);
        waiter.join().unwrap();
    }

    #[test]
    fn wake_with_no_waiters_is_noop() {
        let word = AtomicU32::new(0);
        wake_one(&word);
        wake_all(&word);
    }
}
