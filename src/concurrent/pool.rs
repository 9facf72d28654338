//! Bounded worker pool with adaptive sizing
//!
//! Every pool owns one bounded queue. Producers block when it is full, which
//! is how a fast reader is throttled by slow writers. The pool starts
//! `min_threads` workers up front and grows towards `max_threads` while work
//! piles up, according to its [`PoolSizeAdaptation`].

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors returned when submitting work
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool '{0}' is shut down")]
    ShutDown(String),

    #[error("worker pool '{0}' has no workers")]
    NoWorkers(String),
}

/// A worker processes one item at a time on its own thread
pub trait Worker<T>: Send {
    fn do_work(&mut self, work: T);

    /// Called after `do_work` panicked, before the next item is taken
    fn recover(&mut self) {}

    /// Called once when the worker's thread exits
    fn shutdown(&mut self) {}
}

/// Creates workers for a pool. Returning `None` means no worker could be
/// created right now (e.g. no database connection available).
pub trait WorkerFactory<T>: Send + Sync {
    fn create_worker(&self) -> Option<Box<dyn Worker<T>>>;
}

/// When a pool adds workers beyond its core size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSizeAdaptation {
    /// Grow as soon as any work is queued
    Aggressive,
    /// Grow once the queue is at least half full
    Moderate,
    /// Never grow beyond the core size
    Strict,
}

struct PoolState {
    /// Items submitted but not yet finished
    pending: usize,
    /// Worker threads still running
    alive: usize,
}

struct Shared<T> {
    name: String,
    factory: Box<dyn WorkerFactory<T>>,
    receiver: Receiver<T>,
    state: Mutex<PoolState>,
    idle: Condvar,
    discard: AtomicBool,
    processed: AtomicU64,
    discarded: AtomicU64,
}

impl<T> Shared<T> {
    fn finish_one(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }

    fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.alive -= 1;
        self.idle.notify_all();
    }
}

/// Generic bounded worker pool shared by all pipeline stages
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    sender: Mutex<Option<Sender<T>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    min_threads: usize,
    max_threads: usize,
    capacity: usize,
    adaptation: PoolSizeAdaptation,
    spawned: AtomicU64,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool. No threads are started until
    /// [`prestart_core_workers`](Self::prestart_core_workers) or the first
    /// submission.
    pub fn new(
        name: impl Into<String>,
        min_threads: usize,
        max_threads: usize,
        adaptation: PoolSizeAdaptation,
        factory: impl WorkerFactory<T> + 'static,
        queue_size: usize,
    ) -> Self {
        let capacity = queue_size.max(1);
        let (sender, receiver) = bounded(capacity);
        let min_threads = min_threads.max(1);

        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                factory: Box::new(factory),
                receiver,
                state: Mutex::new(PoolState {
                    pending: 0,
                    alive: 0,
                }),
                idle: Condvar::new(),
                discard: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(Vec::new()),
            min_threads,
            max_threads: max_threads.max(min_threads),
            capacity,
            adaptation,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start the core workers. Returns the resulting pool size.
    pub fn prestart_core_workers(&self) -> usize {
        while self.pool_size() < self.min_threads {
            if !self.spawn_worker(self.min_threads) {
                break;
            }
        }
        self.pool_size()
    }

    /// Number of live worker threads
    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().alive
    }

    /// Items processed so far
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Items dropped by a forced shutdown
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    /// Submit work, blocking while the queue is full
    pub fn add_work(&self, work: T) -> Result<(), PoolError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| PoolError::ShutDown(self.shared.name.clone()))?;

        // Queued work would never be taken. A concurrent caller may have
        // reserved the first worker already.
        if self.pool_size() == 0 && !self.spawn_worker(1) && self.pool_size() == 0 {
            return Err(PoolError::NoWorkers(self.shared.name.clone()));
        }

        self.shared.state.lock().pending += 1;
        if sender.send(work).is_err() {
            self.shared.finish_one();
            return Err(PoolError::ShutDown(self.shared.name.clone()));
        }

        self.adapt_pool_size();
        Ok(())
    }

    /// Block until every submitted item has been processed. The pool stays
    /// open for more work.
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 && state.alive > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Reject new work, let the workers finish the queue, and wait for them
    pub fn shutdown_and_wait(&self) {
        self.sender.lock().take();
        self.join_threads();
    }

    /// Reject new work, drop whatever is still queued, and wait for the
    /// in-flight items to finish
    pub fn shutdown_now(&self) {
        self.shared.discard.store(true, Ordering::SeqCst);
        self.sender.lock().take();
        self.join_threads();
    }

    /// True once the pool is shut down and all workers have exited
    pub fn is_terminated(&self) -> bool {
        self.sender.lock().is_none() && self.handles.lock().is_empty() && self.pool_size() == 0
    }

    fn join_threads(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread of pool '{}' panicked", self.shared.name);
            }
        }
        debug!(
            "Pool '{}' terminated ({} processed, {} discarded)",
            self.shared.name,
            self.processed(),
            self.discarded()
        );
    }

    fn adapt_pool_size(&self) {
        let size = self.pool_size();
        if size >= self.max_threads {
            return;
        }

        let queued = self.shared.receiver.len();
        let grow = match self.adaptation {
            PoolSizeAdaptation::Aggressive => queued > 0,
            PoolSizeAdaptation::Moderate => queued * 2 >= self.capacity,
            PoolSizeAdaptation::Strict => false,
        };
        if grow {
            self.spawn_worker(self.max_threads);
        }
    }

    /// Start one worker unless `limit` workers are already alive
    fn spawn_worker(&self, limit: usize) -> bool {
        // Never spawn after shutdown
        if self.sender.lock().is_none() {
            return false;
        }

        // Reserve the slot first so concurrent callers cannot overshoot
        {
            let mut state = self.shared.state.lock();
            if state.alive >= limit {
                return false;
            }
            state.alive += 1;
        }

        let Some(mut worker) = self.shared.factory.create_worker() else {
            warn!("Pool '{}' could not create a worker", self.shared.name);
            self.shared.worker_exited();
            return false;
        };

        let shared = Arc::clone(&self.shared);
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", shared.name, index))
            .spawn(move || {
                while let Ok(work) = shared.receiver.recv() {
                    if shared.discard.load(Ordering::SeqCst) {
                        drop(work);
                        shared.discarded.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let outcome = catch_unwind(AssertUnwindSafe(|| worker.do_work(work)));
                        if outcome.is_err() {
                            error!("Worker of pool '{}' panicked while processing an item", shared.name);
                            worker.recover();
                        }
                        shared.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    shared.finish_one();
                }

                worker.shutdown();
                shared.worker_exited();
            });

        match spawned {
            Ok(handle) => {
                self.handles.lock().push(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn worker for pool '{}': {}", self.shared.name, e);
                self.shared.worker_exited();
                false
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.shutdown_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Summer {
        total: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Worker<usize> for Summer {
        fn do_work(&mut self, work: usize) {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.total.fetch_add(work, Ordering::SeqCst);
        }
    }

    struct SummerFactory {
        total: Arc<AtomicUsize>,
        delay: Duration,
        limit: Option<usize>,
        created: AtomicUsize,
    }

    impl SummerFactory {
        fn new(total: Arc<AtomicUsize>) -> Self {
            Self {
                total,
                delay: Duration::ZERO,
                limit: None,
                created: AtomicUsize::new(0),
            }
        }
    }

    impl WorkerFactory<usize> for SummerFactory {
        fn create_worker(&self) -> Option<Box<dyn Worker<usize>>> {
            let created = self.created.fetch_add(1, Ordering::SeqCst);
            if self.limit.is_some_and(|limit| created >= limit) {
                return None;
            }
            Some(Box::new(Summer {
                total: Arc::clone(&self.total),
                delay: self.delay,
            }))
        }
    }

    #[test]
    fn test_processes_all_work() {
        let total = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            "sum",
            2,
            4,
            PoolSizeAdaptation::Aggressive,
            SummerFactory::new(Arc::clone(&total)),
            8,
        );
        assert_eq!(pool.prestart_core_workers(), 2);

        for i in 1..=100 {
            pool.add_work(i).unwrap();
        }
        pool.shutdown_and_wait();

        assert_eq!(total.load(Ordering::SeqCst), 5050);
        assert_eq!(pool.processed(), 100);
        assert!(pool.is_terminated());
        assert!(pool.pool_size() <= 4);
    }

    #[test]
    fn test_join_keeps_pool_open() {
        let total = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            "join",
            1,
            1,
            PoolSizeAdaptation::Strict,
            SummerFactory::new(Arc::clone(&total)),
            2,
        );
        pool.prestart_core_workers();

        pool.add_work(5).unwrap();
        pool.join();
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(!pool.is_terminated());

        pool.add_work(7).unwrap();
        pool.shutdown_and_wait();
        assert_eq!(total.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_rejects_work_after_shutdown() {
        let total = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            "closed",
            1,
            1,
            PoolSizeAdaptation::Strict,
            SummerFactory::new(total),
            1,
        );
        pool.prestart_core_workers();
        pool.shutdown_and_wait();
        assert_eq!(pool.add_work(1), Err(PoolError::ShutDown("closed".into())));
    }

    #[test]
    fn test_factory_failure_leaves_empty_pool() {
        let total = Arc::new(AtomicUsize::new(0));
        let mut factory = SummerFactory::new(total);
        factory.limit = Some(0);
        let pool = WorkerPool::new("empty", 2, 2, PoolSizeAdaptation::Strict, factory, 2);
        assert_eq!(pool.prestart_core_workers(), 0);
        assert_eq!(pool.add_work(1), Err(PoolError::NoWorkers("empty".into())));
        pool.shutdown_now();
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_shutdown_now_discards_queue() {
        let total = Arc::new(AtomicUsize::new(0));
        let mut factory = SummerFactory::new(Arc::clone(&total));
        factory.delay = Duration::from_millis(20);
        let pool = WorkerPool::new("slow", 1, 1, PoolSizeAdaptation::Strict, factory, 16);
        pool.prestart_core_workers();

        for _ in 0..10 {
            pool.add_work(1).unwrap();
        }
        pool.shutdown_now();

        assert!(pool.is_terminated());
        assert_eq!(pool.processed() + pool.discarded(), 10);
        assert!(pool.discarded() > 0);
        assert_eq!(total.load(Ordering::SeqCst) as u64, pool.processed());
    }

    #[test]
    fn test_panicking_worker_keeps_thread_alive() {
        struct Panicky;
        impl Worker<bool> for Panicky {
            fn do_work(&mut self, explode: bool) {
                if explode {
                    panic!("malformed item");
                }
            }
        }
        struct PanickyFactory;
        impl WorkerFactory<bool> for PanickyFactory {
            fn create_worker(&self) -> Option<Box<dyn Worker<bool>>> {
                Some(Box::new(Panicky))
            }
        }

        let pool = WorkerPool::new("panic", 1, 1, PoolSizeAdaptation::Strict, PanickyFactory, 4);
        pool.prestart_core_workers();
        pool.add_work(true).unwrap();
        pool.add_work(false).unwrap();
        pool.join();
        assert_eq!(pool.pool_size(), 1);
        assert_eq!(pool.processed(), 2);
        pool.shutdown_and_wait();
    }

    #[test]
    fn test_recover_runs_after_panic() {
        struct Fragile {
            recovered: Arc<AtomicUsize>,
        }
        impl Worker<bool> for Fragile {
            fn do_work(&mut self, explode: bool) {
                if explode {
                    panic!("half-written item");
                }
            }

            fn recover(&mut self) {
                self.recovered.fetch_add(1, Ordering::SeqCst);
            }
        }
        struct FragileFactory(Arc<AtomicUsize>);
        impl WorkerFactory<bool> for FragileFactory {
            fn create_worker(&self) -> Option<Box<dyn Worker<bool>>> {
                Some(Box::new(Fragile {
                    recovered: Arc::clone(&self.0),
                }))
            }
        }

        let recovered = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            "fragile",
            1,
            1,
            PoolSizeAdaptation::Strict,
            FragileFactory(Arc::clone(&recovered)),
            4,
        );
        pool.prestart_core_workers();
        pool.add_work(false).unwrap();
        pool.add_work(true).unwrap();
        pool.add_work(false).unwrap();
        pool.shutdown_and_wait();

        assert_eq!(recovered.load(Ordering::SeqCst), 1);
        assert_eq!(pool.processed(), 3);
    }

    #[test]
    fn test_concurrent_submitters_respect_max_threads() {
        struct CountingFactory {
            created: Arc<AtomicUsize>,
            total: Arc<AtomicUsize>,
        }
        impl WorkerFactory<usize> for CountingFactory {
            fn create_worker(&self) -> Option<Box<dyn Worker<usize>>> {
                self.created.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(Summer {
                    total: Arc::clone(&self.total),
                    delay: Duration::from_millis(2),
                }))
            }
        }

        let created = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(WorkerPool::new(
            "bounded",
            1,
            3,
            PoolSizeAdaptation::Aggressive,
            CountingFactory {
                created: Arc::clone(&created),
                total: Arc::clone(&total),
            },
            4,
        ));

        let submitters: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..20 {
                        pool.add_work(1).unwrap();
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }
        pool.shutdown_and_wait();

        assert_eq!(total.load(Ordering::SeqCst), 320);
        assert!(created.load(Ordering::SeqCst) <= 3);
        assert!(created.load(Ordering::SeqCst) >= 1);
    }
}
