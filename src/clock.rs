//! Clock abstractions and absolute deadlines used by retrying tasks.
//!
//! All task timestamps are milliseconds on a monotonic [`Clock`]; deadlines are absolute points on
//! that same timeline, or [`Deadline::Never`] for tasks that must not time out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts; deadlines computed from it are only meaningful within
/// the process that created them.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for deterministic tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Absolute point after which a task makes no further attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// Milliseconds on the task clock.
    At(u64),
    /// The task retries until it succeeds, fails terminally or is aborted.
    Never,
}

impl Deadline {
    /// Deadline `timeout` after `now_millis`, saturating to [`Deadline::Never`].
    pub fn after(now_millis: u64, timeout: Duration) -> Self {
        u64::try_from(timeout.as_millis())
            .ok()
            .and_then(|t| now_millis.checked_add(t))
            .map_or(Deadline::Never, Deadline::At)
    }

    /// Earlier of the two deadlines.
    pub fn earliest(self, other: Deadline) -> Deadline {
        self.min(other)
    }

    /// Signed milliseconds left before the deadline, `i64::MAX` for `Never`.
    pub fn remaining_millis(&self, now_millis: u64) -> i64 {
        match self {
            Deadline::At(at) => {
                let diff = i128::from(*at) - i128::from(now_millis);
                diff.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
            }
            Deadline::Never => i64::MAX,
        }
    }

    pub fn has_passed(&self, now_millis: u64) -> bool {
        matches!(self, Deadline::At(at) if *at <= now_millis)
    }
}
