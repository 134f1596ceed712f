#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # remote-tasks
//!
//! Retrying remote tasks for a cluster control plane: a control node sends administrative
//! requests (create or delete a replica, change a consensus config, alter a schema, ...) to
//! storage nodes and keeps retrying them until they take effect, fail for good, exhaust their
//! retry budget or deadline, or are aborted.
//!
//! ## Features
//!
//! - **Explicit state machine** (`Waiting → Running → Scheduling → Waiting`, terminal
//!   `Complete`/`Failed`/`Aborted`) driven by atomic compare-and-swap transitions
//! - **Exponential backoff** with additive jitter, capped by a live-tunable maximum delay and by
//!   the task deadline
//! - **Target re-resolution** on every attempt (specific node or current partition leader)
//! - **Throttling** of outstanding requests with RAII slots
//! - **Owner tracking** so a resource can abort and wait for its tasks on teardown
//! - **Telemetry** events delivered to pluggable `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use remote_tasks::{Backoff, BackoffDecision, Deadline, Jitter};
//! use std::time::Duration;
//!
//! let backoff = Backoff::new(Duration::from_secs(60)).with_jitter(Jitter::None);
//! // Third attempt, 10s left before the deadline.
//! let decision = backoff.next_delay(3, 0, Deadline::At(10_000));
//! assert_eq!(decision, BackoffDecision::Retry(Duration::from_millis(64)));
//! ```
//!
//! See [`task`] for driving a [`RemoteOperation`] end to end and [`ops`] for the tablet
//! operations built on it.

pub mod adaptive;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod jitter;
pub mod ops;
pub mod owner;
pub mod picker;
pub mod prelude;
pub mod scheduler;
pub mod sleeper;
pub mod state;
pub mod task;
pub mod telemetry;
pub mod throttle;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffDecision};
pub use clock::{Clock, Deadline, ManualClock, MonotonicClock};
pub use config::{RetryPolicy, TaskConfig, TaskConfigBuilder};
pub use error::{ConfigError, PoolError, RemoteError, ServerErrorCode, StatusCode, TaskError};
pub use executor::{CallbackExecutor, Job, WorkerPool};
pub use jitter::Jitter;
pub use owner::{MonitoredTask, OwnerResource, TaskTracker};
pub use picker::{
    ConnectionProxy, InMemoryNodeRegistry, NodeDescriptor, NodeHandle, NodeId, NodeRegistry,
    PartitionId, PickLeader, PickSpecificNode, ReplicaPicker, ServiceKind,
};
pub use scheduler::{Scheduler, TimerCallback, TimerId, TokioScheduler};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use state::{TaskId, TaskKind, TaskState};
pub use task::{
    AttemptContext, Dispatch, Outcome, RemoteOperation, RetryingTask, TaskBuilder, TaskEnv,
    TerminalOutcome,
};
pub use telemetry::{
    LogSink, MemorySink, NonBlockingSink, NullSink, TaskEvent, Telemetry, TelemetrySink,
};
pub use throttle::{BulkheadThrottler, TaskThrottler, ThrottlePermit, Unthrottled};
