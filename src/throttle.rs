//! Admission control for outstanding task requests.
//!
//! A throttled task asks for a slot right before sending and gives it back when the response
//! arrives (or the send does not happen). The slot is held by a [`ThrottlePermit`], so it is
//! returned on every path, including early returns and panics.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Limits how many throttled requests may be outstanding at once.
pub trait TaskThrottler: Send + Sync + fmt::Debug {
    /// Take a slot if one is free.
    fn try_admit(&self) -> bool;
    /// Give back a slot taken by a successful [`try_admit`](TaskThrottler::try_admit).
    fn release(&self);
}

/// Semaphore-backed throttler with a fixed number of slots.
#[derive(Debug, Clone)]
pub struct BulkheadThrottler {
    semaphore: Arc<Semaphore>,
    max_outstanding: usize,
}

impl BulkheadThrottler {
    pub fn new(max_outstanding: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_outstanding)), max_outstanding }
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    pub fn outstanding(&self) -> usize {
        self.max_outstanding.saturating_sub(self.semaphore.available_permits())
    }
}

impl TaskThrottler for BulkheadThrottler {
    fn try_admit(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                // Returned explicitly through `release`.
                permit.forget();
                true
            }
            Err(_) => {
                tracing::debug!(
                    outstanding = self.outstanding(),
                    max = self.max_outstanding,
                    "throttler rejected request"
                );
                false
            }
        }
    }

    fn release(&self) {
        if self.semaphore.available_permits() >= self.max_outstanding {
            tracing::error!(
                max = self.max_outstanding,
                "throttler released more slots than admitted"
            );
            return;
        }
        self.semaphore.add_permits(1);
    }
}

/// Throttler that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unthrottled;

impl TaskThrottler for Unthrottled {
    fn try_admit(&self) -> bool {
        true
    }

    fn release(&self) {}
}

/// A held throttler slot, released on drop.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct ThrottlePermit {
    throttler: Option<Arc<dyn TaskThrottler>>,
}

impl ThrottlePermit {
    /// Take a slot from `throttler`, or `None` if it is full.
    pub fn try_acquire(throttler: &Arc<dyn TaskThrottler>) -> Option<Self> {
        throttler.try_admit().then(|| Self { throttler: Some(throttler.clone()) })
    }

    /// Release the slot now.
    pub fn release(mut self) {
        if let Some(throttler) = self.throttler.take() {
            throttler.release();
        }
    }
}

impl fmt::Debug for ThrottlePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlePermit").field("held", &self.throttler.is_some()).finish()
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if let Some(throttler) = self.throttler.take() {
            throttler.release();
        }
    }
}
