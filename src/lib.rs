//! Core concurrency primitives and probabilistic data structures.
//!
//! # Scope
//! `stdx` hosts the reusable substrate the rest of the toolkit is built on:
//! bounded lock-free queues, a cursor-based overwriting ring, futex-backed
//! mutexes, a fixed thread pool, and a binary fuse membership filter. They
//! are tuned for predictable memory use and fast paths rather than
//! general-purpose ergonomics.
//!
//! # Design themes
//! - Fixed or upfront capacity; backpressure is explicit (`try_*` returns the
//!   rejected value, blocking variants spin or park).
//! - Tight invariants enable `unsafe` fast paths (documented per type).
//! - Storage is owned by the structure and allocated once at construction;
//!   destruction must not race with user operations.
//! - Hot atomic state is cache-line padded to avoid false sharing.
//!
//! # Module map
//! - `mpmc`: bounded lock-free MPMC queue with per-slot turn counters.
//! - `ring_buffer`: overwriting multi-writer ring with cursor reads.
//! - `spsc`: wait-free single-producer/single-consumer queue.
//! - `futex`: thin wait/wake wrappers over the Linux futex syscall.
//! - `mutex`: compact three-state futex mutex.
//! - `queued_mutex`: parked-waiter mutex with an intrusive wait list.
//! - `spin`: spinlock, bit-level lock, and a padded statistics counter.
//! - `thread_pool`: fixed worker set pulling from an owned MPMC queue.
//! - `fuse`: binary fuse filter for approximate membership over `u64` keys.
//!
//! # Safety
//! Several types use `unsafe` internally and rely on invariants called out in
//! their module docs. Read those before extending or reusing the internals.

pub mod fuse;
pub mod futex;
pub mod mpmc;
pub mod mutex;
pub mod queued_mutex;
pub mod ring_buffer;
pub mod spin;
pub mod spsc;
#[cfg(test)]
pub mod test_utils;
pub mod thread_pool;

pub use fuse::{BinaryFuse, BinaryFuse16, BinaryFuse32, BinaryFuse8, FilterError};
pub use mpmc::MpmcQueue;
pub use mutex::{Mutex, MutexGuard};
pub use queued_mutex::{LockTimeout, QueuedMutex, QueuedMutexGuard};
pub use ring_buffer::{Cursor, LockFreeRingBuffer};
pub use spin::{AtomicCounter, SpinBitLock, SpinLock};
pub use spsc::SpscQueue;
pub use thread_pool::{PoolConfig, PoolError, PoolMetrics, ThreadPool};
