//! Jitter added on top of the exponential retry delay.
//!
//! When to use which strategy:
//! - `None`: deterministic retries for tests or tightly controlled workflows.
//! - `Additive`: uniform extra delay in `[0, ceiling)` on top of the base delay. Tasks use a 50ms
//!   ceiling by default so that many tasks failing against the same node do not retry in lockstep.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//!   `apply_with_rng` / `sample_millis`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large
//!   durations.
//!
//! Example:
//! ```rust
//! use remote_tasks::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::default();
//! let delayed = jitter.apply(Duration::from_millis(16));
//! assert!(delayed >= Duration::from_millis(16));
//! assert!(delayed < Duration::from_millis(66));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Upper bound (exclusive) of the random delay added to every retry.
pub const DEFAULT_JITTER_CEILING: Duration = Duration::from_millis(50);

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Add a uniformly distributed delay in `[0, ceiling)`.
    Additive(Duration),
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Additive(DEFAULT_JITTER_CEILING)
    }
}

impl Jitter {
    /// Create an additive jitter strategy with an exclusive ceiling.
    pub fn additive(ceiling: Duration) -> Self {
        Jitter::Additive(ceiling)
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        delay.saturating_add(Duration::from_millis(self.sample_millis(rng)))
    }

    /// Draw the jitter component alone, in milliseconds.
    pub fn sample_millis<R: Rng>(&self, rng: &mut R) -> u64 {
        match self {
            Jitter::None => 0,
            Jitter::Additive(ceiling) => {
                let ceiling = as_millis_saturated(*ceiling);
                if ceiling == 0 {
                    return 0;
                }
                rng.random_range(0..ceiling)
            }
        }
    }
}

pub(crate) fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
}
