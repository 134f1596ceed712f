//! Worker pool for response handlers.
//!
//! RPC completions arrive on runtime threads, which must never block. Response handling may block
//! (catalog writes, for instance), so it is handed to a [`CallbackExecutor`] that runs it on
//! dedicated OS threads. The queue between the two is bounded; a rejected submission is reported
//! to the caller, which aborts the task instead of dropping it.

use crate::error::{PoolError, TaskError};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs off the runtime threads.
pub trait CallbackExecutor: Send + Sync + fmt::Debug {
    fn submit(&self, job: Job) -> Result<(), TaskError>;
}

/// Fixed-size pool of named worker threads fed through a bounded queue.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed: Arc<AtomicU64>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("completed", &self.completed())
            .field("open", &self.is_open())
            .finish()
    }
}

impl WorkerPool {
    /// Start `threads` workers sharing a queue of `capacity` jobs.
    pub fn new(
        name: impl Into<String>,
        threads: usize,
        capacity: usize,
    ) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::NoWorkers);
        }
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let completed = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&rx);
            let completed = Arc::clone(&completed);
            let worker = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(rx, completed))?;
            workers.push(worker);
        }

        tracing::debug!(pool = %name, threads, capacity, "worker pool started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            completed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs run to completion (including ones that panicked).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Close the queue, let workers drain what was already accepted, and join them.
    ///
    /// Must not be called from one of the pool's own workers.
    pub fn shutdown(&self) {
        self.close();
        let workers: Vec<_> =
            self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked outside a job");
            }
        }
        tracing::info!(pool = %self.name, completed = self.completed(), "worker pool stopped");
    }

    fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue is closed and drained.
        self.close();
    }
}

impl CallbackExecutor for WorkerPool {
    fn submit(&self, job: Job) -> Result<(), TaskError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sender) = sender else {
            return Err(TaskError::ShuttingDown(format!("worker pool {} is closed", self.name)));
        };
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TaskError::Rejected(format!("worker pool {} queue is full", self.name))
            }
            mpsc::error::TrySendError::Closed(_) => {
                TaskError::ShuttingDown(format!("worker pool {} is closed", self.name))
            }
        })
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>, completed: Arc<AtomicU64>) {
    loop {
        let job = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
        let Some(job) = job else { break };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("response handler panicked");
        }
        completed.fetch_add(1, Ordering::Relaxed);
    }
}
