//! Delayed callbacks for retries.
//!
//! A task that needs another attempt hands a [`TimerCallback`] to a [`Scheduler`] and keeps the
//! returned [`TimerId`] so it can cancel the timer if the task is aborted in the meantime. The
//! callback always runs exactly once: with `Ok(())` when the delay elapsed, or with an error
//! when the timer was cancelled or the scheduler shut down.

use crate::error::TaskError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Handle of a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(NonZeroU64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    /// `None` for zero, which never names a timer.
    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(TimerId)
    }
}

/// Work run when a timer fires or is cancelled.
pub type TimerCallback = Box<dyn FnOnce(Result<(), TaskError>) + Send + 'static>;

/// Runs callbacks after a delay.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Schedule `callback` after `delay`. `None` means the scheduler refused the work, in which
    /// case the callback has been dropped without running.
    ///
    /// The callback must never run inline on the calling thread, not even for a zero delay: a
    /// retrying task is still in its transient `Scheduling` state while this call is in progress
    /// and its next attempt waits for that state to clear.
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> Option<TimerId>;

    /// Cancel a pending timer; its callback runs with [`TaskError::Aborted`]. Unknown or already
    /// fired timers are ignored.
    fn cancel(&self, id: TimerId);
}

/// Scheduler running timers as tasks on a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    sleeper: Arc<dyn Sleeper>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<TimerId, oneshot::Sender<TaskError>>>,
    closing: AtomicBool,
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending_timers())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self::with_sleeper(handle, TokioSleeper)
    }

    /// Use a custom sleeper, e.g. an instant one in tests.
    pub fn with_sleeper<S: Sleeper + 'static>(handle: Handle, sleeper: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                sleeper: Arc::new(sleeper),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Refuse new timers and fire every pending one with [`TaskError::ShuttingDown`].
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut pending = self.inner.pending();
            self.inner.closing.store(true, Ordering::Release);
            pending.drain().collect()
        };
        tracing::info!(cancelled = drained.len(), "scheduler shutting down");
        for (_, cancel) in drained {
            let _ = cancel.send(TaskError::ShuttingDown("scheduler closing".into()));
        }
    }
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<TimerId, oneshot::Sender<TaskError>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> Option<TimerId> {
        let id = TimerId::from_u64(self.inner.next_id.fetch_add(1, Ordering::Relaxed))?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if self.inner.closing.load(Ordering::Acquire) {
                tracing::debug!("scheduler closing; timer refused");
                return None;
            }
            pending.insert(id, cancel_tx);
        }

        let inner = Arc::clone(&self.inner);
        let sleep = self.inner.sleeper.sleep(delay);
        self.inner.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                reason = cancel_rx => Err(reason.unwrap_or_else(|_| {
                    TaskError::Aborted("timer dropped".into())
                })),
                _ = sleep => Ok(()),
            };
            inner.pending().remove(&id);
            callback(result);
        });
        Some(id)
    }

    fn cancel(&self, id: TimerId) {
        let cancel = self.inner.pending().remove(&id);
        match cancel {
            Some(cancel) => {
                let _ = cancel.send(TaskError::Aborted("timer cancelled".into()));
            }
            None => tracing::trace!(timer = id.as_u64(), "cancel for unknown timer ignored"),
        }
    }
}
