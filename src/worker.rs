//! Worker dispatch
//!
//! Listener callbacks never run on the selector thread unless single-thread
//! mode is selected. Each association is pinned to one worker index at start
//! time, and a worker is a single-threaded FIFO executor, so callbacks for
//! one association are delivered in the order the loop produced them.

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Unit of callback work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes callback jobs on behalf of the selector loop
pub trait Dispatcher: Send + Sync {
    /// Run `job` on worker `worker`. Fire-and-forget.
    fn dispatch(&self, worker: usize, job: Job);

    /// Stop accepting work, drain what is queued and join any threads
    fn shutdown(&self);
}

fn run_guarded(worker: usize, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(worker, "Listener callback panicked");
    }
}

/// Runs every job immediately on the calling (selector) thread
#[derive(Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, worker: usize, job: Job) {
        run_guarded(worker, job);
    }

    fn shutdown(&self) {}
}

/// Fixed set of single-threaded executors with one FIFO queue each
pub struct PooledDispatcher {
    senders: Mutex<Vec<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PooledDispatcher {
    /// Spawn `workers` executor threads named after `name`
    pub fn new(name: &str, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = unbounded::<Job>();
            let handle = thread::Builder::new()
                .name(format!("sctp-worker-{name}-{index}"))
                .spawn(move || {
                    // Ends once every sender is dropped and the queue is empty
                    for job in rx.iter() {
                        run_guarded(index, job);
                    }
                    debug!(worker = index, "Worker exited");
                })?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
        })
    }

    /// Number of executors still accepting work
    pub fn workers(&self) -> usize {
        self.senders.lock().len()
    }
}

impl Dispatcher for PooledDispatcher {
    fn dispatch(&self, worker: usize, job: Job) {
        let senders = self.senders.lock();
        if senders.is_empty() {
            warn!(worker, "Dispatch after shutdown dropped");
            return;
        }
        let index = worker % senders.len();
        if senders[index].send(job).is_err() {
            warn!(worker = index, "Worker queue closed, job dropped");
        }
    }

    fn shutdown(&self) {
        self.senders.lock().clear();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PooledDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Round-robin worker index assignment
#[derive(Debug)]
pub struct WorkerAssigner {
    workers: AtomicUsize,
    assigned: AtomicUsize,
}

impl WorkerAssigner {
    /// Assigner over `workers` slots
    pub fn new(workers: usize) -> Self {
        Self {
            workers: AtomicUsize::new(workers.max(1)),
            assigned: AtomicUsize::new(0),
        }
    }

    /// Change the slot count used by later assignments
    pub fn configure(&self, workers: usize) {
        self.workers.store(workers.max(1), Ordering::SeqCst);
    }

    /// Current slot count
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Next `count` worker indices, continuing the shared cursor
    pub fn assign(&self, count: usize) -> Vec<usize> {
        let workers = self.workers();
        let first = self.assigned.fetch_add(count, Ordering::SeqCst);
        (first..first + count).map(|total| total % workers).collect()
    }
}
