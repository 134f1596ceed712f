//! Telemetry for retrying tasks.
//!
//! Tasks emit a [`TaskEvent`] at every step of their lifecycle. Events flow into a sink, which is
//! any `tower::Service<TaskEvent>`; the [`Telemetry`] handle stored in the task environment wraps
//! whichever sink the caller configured.
//!
//! Emission is best-effort and never blocks a task: the task machinery runs on runtime threads
//! and inside timer callbacks, so a sink that is not immediately ready loses the event. Use
//! [`NonBlockingSink`] in front of slow sinks.
//!
//! ```rust
//! use remote_tasks::telemetry::{MemorySink, TaskEvent, Telemetry};
//! use remote_tasks::{TaskId, TaskKind, TaskState};
//! use std::time::Duration;
//!
//! let sink = MemorySink::new();
//! let telemetry = Telemetry::new(sink.clone());
//! telemetry.emit(TaskEvent::Terminal {
//!     id: TaskId::from_raw(7),
//!     kind: TaskKind::DeleteReplica,
//!     state: TaskState::Complete,
//!     attempts: 1,
//!     duration: Duration::from_millis(12),
//! });
//! assert_eq!(sink.len(), 1);
//! ```

use crate::picker::NodeId;
use crate::state::{TaskId, TaskKind, TaskState};
use futures::FutureExt;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// Boxed error type produced by type-erased sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A telemetry sink that consumes task events.
pub trait TelemetrySink:
    Service<TaskEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Lifecycle events emitted by retrying tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A request is about to be sent.
    AttemptStarted { id: TaskId, kind: TaskKind, attempt: u32, target: NodeId },
    /// The throttler refused the attempt; it will be retried.
    Throttled { id: TaskId, kind: TaskKind, attempt: u32 },
    /// A retry was handed to the scheduler.
    RetryScheduled { id: TaskId, kind: TaskKind, attempt: u32, delay: Duration },
    /// A response (or transport failure) was received for an attempt.
    AttemptFinished { id: TaskId, kind: TaskKind, attempt: u32, success: bool, latency: Duration },
    /// The task reached a terminal state and was unregistered.
    Terminal { id: TaskId, kind: TaskKind, state: TaskState, attempts: u32, duration: Duration },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::AttemptStarted { id, .. }
            | TaskEvent::Throttled { id, .. }
            | TaskEvent::RetryScheduled { id, .. }
            | TaskEvent::AttemptFinished { id, .. }
            | TaskEvent::Terminal { id, .. } => *id,
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::AttemptStarted { id, kind, attempt, target } => {
                write!(f, "{kind}::AttemptStarted({id}, #{attempt}, target={target})")
            }
            TaskEvent::Throttled { id, kind, attempt } => {
                write!(f, "{kind}::Throttled({id}, #{attempt})")
            }
            TaskEvent::RetryScheduled { id, kind, attempt, delay } => {
                write!(f, "{kind}::RetryScheduled({id}, #{attempt}, delay={delay:?})")
            }
            TaskEvent::AttemptFinished { id, kind, attempt, success, latency } => {
                write!(
                    f,
                    "{kind}::AttemptFinished({id}, #{attempt}, success={success}, latency={latency:?})"
                )
            }
            TaskEvent::Terminal { id, kind, state, attempts, duration } => {
                write!(
                    f,
                    "{kind}::Terminal({id}, state={state}, attempts={attempts}, duration={duration:?})"
                )
            }
        }
    }
}

/// Type-erased, shareable sink handle used by tasks.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<TaskEvent, (), BoxError>>>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").field("dropped", &self.dropped()).finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: Service<TaskEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        let sink = BoxCloneService::new(sink.map_err(|e: S::Error| -> BoxError { e.into() }));
        Self { sink: Arc::new(Mutex::new(sink)), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Deliver an event if the sink can take it right now; drop it otherwise.
    pub fn emit(&self, event: TaskEvent) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let delivered = match sink.ready().now_or_never() {
            Some(Ok(ready)) => matches!(ready.call(event).now_or_never(), Some(Ok(()))),
            _ => false,
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("telemetry sink not ready; event dropped");
        }
    }

    /// Events the sink could not take immediately.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<TaskEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: TaskEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Terminal events are logged at INFO, everything else at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<TaskEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: TaskEvent) -> Self::Future {
        match &event {
            TaskEvent::Terminal { .. } => tracing::info!(event = %event, "task_event"),
            _ => tracing::debug!(event = %event, "task_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded: the oldest events are evicted once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TaskEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<TaskEvent> {
        self.lock().clone()
    }

    /// Events recorded for one task, oldest first.
    pub fn events_for(&self, id: TaskId) -> Vec<TaskEvent> {
        self.lock().iter().filter(|e| e.task_id() == id).cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TaskEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<TaskEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: TaskEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Offloads telemetry emission to a bounded channel and worker task.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<TaskEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Create a new non-blocking wrapper with bounded queue and background worker.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: Service<TaskEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let mut sink = sink;

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::debug!(error = %e, "telemetry sink rejected event");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "telemetry sink failed; stopping worker");
                        break;
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// How many events were dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl Service<TaskEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: TaskEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}
