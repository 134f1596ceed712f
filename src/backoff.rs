//! Exponential retry delay with additive jitter, bounded by the task deadline.
//!
//! Attempt semantics: `attempt` is the number of sends already made, so the first retry is
//! computed with `attempt = 1` and waits `2^4 = 16ms` plus jitter. The base doubles on every
//! attempt up to `max_delay`; from attempt 13 on the base is `max_delay` outright.
//!
//! The delay never extends past the deadline: a fixed 10ms processing margin is reserved, and when
//! nothing is left the decision is [`BackoffDecision::TimedOut`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use remote_tasks::{Backoff, BackoffDecision, Deadline, Jitter};
//!
//! let backoff = Backoff::new(Duration::from_secs(60)).with_jitter(Jitter::None);
//! assert_eq!(backoff.base_delay(1), Duration::from_millis(16));
//! assert_eq!(backoff.base_delay(2), Duration::from_millis(32));
//! assert_eq!(backoff.base_delay(13), Duration::from_secs(60));
//!
//! // 100ms left on the deadline, minus the 10ms processing margin.
//! let decision = backoff.next_delay(10, 0, Deadline::At(100));
//! assert_eq!(decision, BackoffDecision::Retry(Duration::from_millis(90)));
//! assert_eq!(backoff.next_delay(1, 95, Deadline::At(100)), BackoffDecision::TimedOut);
//! ```

use crate::clock::Deadline;
use crate::jitter::{as_millis_saturated, Jitter};
use rand::{rng, Rng};
use std::time::Duration;

/// Time reserved for processing a request in the best case.
pub const PROCESSING_MARGIN: Duration = Duration::from_millis(10);

/// Last attempt whose base delay still doubles.
pub const LAST_DOUBLING_ATTEMPT: u32 = 12;

/// Outcome of a backoff computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Schedule the next attempt after this delay.
    Retry(Duration),
    /// The deadline leaves no room for another attempt.
    TimedOut,
}

/// Delay calculator for retrying tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_delay: Duration,
    jitter: Jitter,
}

impl Backoff {
    /// Backoff capped at `max_delay` with the default 50ms additive jitter.
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay, jitter: Jitter::default() }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Delay before jitter and deadline capping.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(base_delay_ms(attempt, as_millis_saturated(self.max_delay)))
    }

    /// Compute the wait before the next attempt using the thread-local RNG.
    pub fn next_delay(&self, attempt: u32, now_millis: u64, deadline: Deadline) -> BackoffDecision {
        let mut rng = rng();
        self.next_delay_with_rng(attempt, now_millis, deadline, &mut rng)
    }

    /// Compute the wait before the next attempt with a caller-supplied RNG.
    pub fn next_delay_with_rng<R: Rng>(
        &self,
        attempt: u32,
        now_millis: u64,
        deadline: Deadline,
        rng: &mut R,
    ) -> BackoffDecision {
        let margin = as_millis_saturated(PROCESSING_MARGIN) as i64;
        let remaining = deadline.remaining_millis(now_millis).saturating_sub(margin);
        if remaining <= 0 {
            return BackoffDecision::TimedOut;
        }

        let base = base_delay_ms(attempt, as_millis_saturated(self.max_delay));
        let jittered = base.saturating_add(self.jitter.sample_millis(rng));
        let delay = i64::try_from(jittered).unwrap_or(i64::MAX).min(remaining);
        if delay <= 0 {
            return BackoffDecision::TimedOut;
        }
        BackoffDecision::Retry(Duration::from_millis(delay as u64))
    }
}

fn base_delay_ms(attempt: u32, max_delay_ms: u64) -> u64 {
    if attempt <= LAST_DOUBLING_ATTEMPT {
        (1u64 << (attempt + 3)).min(max_delay_ms)
    } else {
        max_delay_ms
    }
}
