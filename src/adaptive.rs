//! Live-updatable configuration handles.
//!
//! Tasks read a fresh [`TaskConfig`] snapshot at every decision point (deadline computation,
//! retry threshold, backoff ceiling), so an operator can retune a running control plane without
//! restarting outstanding tasks. Reads are lock-free through `ArcSwap`.

use crate::config::TaskConfig;
use crate::error::ConfigError;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure. Concurrent updates are applied one after the other.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}

impl DynamicConfig<TaskConfig> {
    /// Replace the task config if it passes validation; the previous value stays otherwise.
    pub fn try_set(&self, config: TaskConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.set(config);
        Ok(())
    }
}
