//! Fixed-size worker pool.
//!
//! Workers pull boxed jobs from one shared unbounded FIFO channel and run
//! each to completion before taking the next. Submission never blocks; the
//! dispatch loop already bounds admission to one job per ready, idle
//! connection.
//!
//! Shutdown closes the channel. Workers keep draining whatever is still
//! queued and exit once it is empty, so every job accepted before shutdown
//! runs, and none starts after `shutdown` returns.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// `shutdown` has been called; the job was dropped without running.
    ShuttingDown,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ShuttingDown => write!(f, "worker pool is shutting down"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Default)]
struct PoolStats {
    active: AtomicUsize,
    completed: AtomicU64,
    faults: AtomicU64,
}

/// A fixed set of worker threads consuming a shared job queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    size: usize,
}

impl WorkerPool {
    /// Start `worker_count` workers.
    pub fn new(worker_count: usize) -> io::Result<Self> {
        if worker_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let stats = Arc::new(PoolStats::default());
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("chat-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, stats))?;
            workers.push(handle);
        }

        info!(workers = worker_count, "Worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stats,
            size: worker_count,
        })
    }

    /// Enqueue a job without blocking.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(PoolError::ShuttingDown)?;
        // Workers only disconnect after the sender is gone, so this cannot fail
        // while we hold it.
        sender
            .send(Box::new(job))
            .map_err(|_| PoolError::ShuttingDown)
    }

    /// Stop accepting jobs, finish queued and in-flight ones, join workers.
    ///
    /// Concurrent callers all return only after every worker has exited.
    pub fn shutdown(&self) {
        // Held through the joins so a second caller waits for the first.
        let mut workers = self.workers.lock();

        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => {
                debug!(pending = sender.len(), "Worker pool draining");
                drop(sender);
            }
            None if workers.is_empty() => return,
            None => {}
        }

        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }

        info!(
            completed = self.completed(),
            faults = self.faults(),
            "Worker pool stopped"
        );
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, |s| s.len())
    }

    /// Jobs that have finished, including ones that panicked.
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Acquire)
    }

    /// Jobs that panicked.
    pub fn faults(&self) -> u64 {
        self.stats.faults.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Job>, stats: Arc<PoolStats>) {
    debug!(worker = worker_id, "Worker started");

    while let Ok(job) = receiver.recv() {
        stats.active.fetch_add(1, Ordering::AcqRel);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            stats.faults.fetch_add(1, Ordering::AcqRel);
            error!(
                worker = worker_id,
                fault = %panic_message(payload.as_ref()),
                "Handler fault"
            );
        }
        stats.active.fetch_sub(1, Ordering::AcqRel);
        stats.completed.fetch_add(1, Ordering::AcqRel);
    }

    debug!(worker = worker_id, "Worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.completed(), 100);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().push(i)).unwrap();
        }
        pool.shutdown();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_extra_job_waits_for_free_worker() {
        let workers = 2;
        let pool = WorkerPool::new(workers).unwrap();
        let (started_tx, started_rx) = bounded::<()>(workers);
        let (release_tx, release_rx) = bounded::<()>(workers);

        for _ in 0..workers {
            let started_tx = started_tx.clone();
            let release_rx = release_rx.clone();
            pool.submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        }
        for _ in 0..workers {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        let extra_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&extra_ran);
        pool.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(!extra_ran.load(Ordering::SeqCst));
        assert_eq!(pool.active(), workers);
        assert_eq!(pool.queued(), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.shutdown();
        assert!(extra_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_drains_queued_and_in_flight() {
        let workers = 2;
        let queued = 6;
        let pool = Arc::new(WorkerPool::new(workers).unwrap());
        let done = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = bounded::<()>(workers);

        for _ in 0..workers {
            let done = Arc::clone(&done);
            let started_tx = started_tx.clone();
            pool.submit(move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        for _ in 0..queued {
            let done = Arc::clone(&done);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        for _ in 0..workers {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), workers + queued);
        assert_eq!(pool.active(), 0);

        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        assert_eq!(
            pool.submit(move || flag.store(true, Ordering::SeqCst)),
            Err(PoolError::ShuttingDown)
        );
        thread::sleep(Duration::from_millis(20));
        assert!(!late.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(|| panic!("boom")).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();

        pool.shutdown();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.faults(), 1);
        assert_eq!(pool.completed(), 2);
    }

    #[test]
    fn test_concurrent_shutdown_waits_for_in_flight_job() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = bounded::<()>(1);

        let flag = Arc::clone(&finished);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let first = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.shutdown())
        };
        thread::sleep(Duration::from_millis(20));

        pool.shutdown();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.active(), 0);
        first.join().unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.submit(|| {}), Err(PoolError::ShuttingDown));
    }
}
