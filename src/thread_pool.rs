//! Fixed worker pool pulling tasks from a bounded MPMC queue.
//!
//! # Design
//!
//! ```text
//!   callers ──spawn/spawn_blocking──► MpmcQueue<T> ──try_dequeue──► worker 0..N
//!                                                                    │
//!                               stop: AtomicBool (Release/Acquire) ──┘
//! ```
//!
//! Workers loop on `try_dequeue`; an empty poll checks the stop flag and
//! otherwise issues a pause hint. The queue is the only handoff: a spawn
//! that fits in the queue will run, a `spawn` against a full queue returns
//! the task to the caller.
//!
//! # Shutdown semantics
//!
//! - Tasks already dequeued run to completion.
//! - Tasks still queued at stop time are discarded (drained and dropped,
//!   counted in [`PoolMetrics::tasks_discarded`]).
//! - Worker panics are caught, the first one is kept, and it is propagated
//!   on [`shutdown`](ThreadPool::shutdown); a panicking worker also stops
//!   the pool so the failure is not silent.
//!
//! The handler must not assume it runs on any particular worker; tasks are
//! taken in ticket order but completion order is unconstrained.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::mpmc::MpmcQueue;

/// Pool sizing options. Both fields must be non-zero.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Capacity of the task queue.
    pub queue_capacity: usize,
}

/// Rejected pool configurations.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// `workers` was zero.
    InvalidWorkerCount,
    /// `queue_capacity` was zero.
    InvalidQueueCapacity,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWorkerCount => write!(f, "worker count must be > 0"),
            Self::InvalidQueueCapacity => write!(f, "queue capacity must be > 0"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Counter snapshot; see [`ThreadPool::metrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Tasks fully executed by workers.
    pub tasks_executed: u64,
    /// Tasks dropped from the queue at shutdown.
    pub tasks_discarded: u64,
}

struct Shared<T> {
    queue: MpmcQueue<T>,
    /// Once true, workers exit on their next empty poll.
    stop: AtomicBool,
    executed: AtomicU64,
    discarded: AtomicU64,
    /// First worker panic; later panics are discarded.
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

/// Fixed set of workers over an owned bounded queue.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
/// use stdx::thread_pool::{PoolConfig, ThreadPool};
///
/// let counter = Arc::new(AtomicU64::new(0));
/// let c = Arc::clone(&counter);
/// let pool = ThreadPool::new(
///     PoolConfig { workers: 2, queue_capacity: 8 },
///     move |n: u64| {
///         c.fetch_add(n, Ordering::Relaxed);
///     },
/// )
/// .unwrap();
///
/// for _ in 0..4 {
///     pool.spawn_blocking(1);
/// }
/// pool.shutdown();
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
pub struct ThreadPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Spawns `config.workers` threads running `handler` over queued tasks.
    pub fn new<F>(config: PoolConfig, handler: F) -> Result<Self, PoolError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if config.workers == 0 {
            return Err(PoolError::InvalidWorkerCount);
        }
        if config.queue_capacity == 0 {
            return Err(PoolError::InvalidQueueCapacity);
        }

        let shared = Arc::new(Shared {
            queue: MpmcQueue::new(config.queue_capacity),
            stop: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            panic: Mutex::new(None),
        });
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let handle = std::thread::Builder::new()
                .name(format!("stdx-pool-{i}"))
                .spawn(move || worker_loop(&shared, &*handler))
                .expect("spawn pool worker");
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Non-blocking spawn; returns the task when the queue is full.
    #[inline]
    pub fn spawn(&self, task: T) -> Result<(), T> {
        self.shared.queue.try_enqueue(task)
    }

    /// Blocking spawn; waits for queue space.
    #[inline]
    pub fn spawn_blocking(&self, task: T) {
        self.shared.queue.enqueue(task);
    }

    /// Approximate queue-empty indicator. Queued-but-running tasks do not
    /// count; exact only after [`shutdown`](Self::shutdown).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Counter snapshot; eventually consistent while workers run.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            tasks_executed: self.shared.executed.load(Ordering::Relaxed),
            tasks_discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stops the workers, joins them, and discards whatever is still queued.
    ///
    /// In-flight tasks run to completion first. Propagates the first worker
    /// panic, if any.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
        let panic = self
            .shared
            .panic
            .lock()
            .expect("pool panic slot poisoned")
            .take();
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
    }

    fn shutdown_inner(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            // Worker panics are already captured in `shared.panic`.
            let _ = handle.join();
        }
        // Workers are gone; whatever is left was never started.
        while self.shared.queue.try_dequeue().is_some() {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown_inner();
        // A captured panic is only re-raised by `shutdown`; raising here
        // would abort when dropping during an unwind.
    }
}

fn worker_loop<T, F>(shared: &Shared<T>, handler: &F)
where
    F: Fn(T),
{
    loop {
        match shared.queue.try_dequeue() {
            Some(task) => {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(task)));
                match result {
                    Ok(()) => {
                        shared.executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => {
                        let mut slot = shared.panic.lock().expect("pool panic slot poisoned");
                        if slot.is_none() {
                            *slot = Some(payload);
                        }
                        drop(slot);
                        // A failed handler stops the pool; remaining tasks
                        // are discarded at join time.
                        shared.stop.store(true, Ordering::Release);
                        return;
                    }
                }
            }
            None => {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                std::hint::spin_loop();
            }
        }
    }
}
