//! Convenient re-exports for building and running tasks.
pub use crate::{
    adaptive::DynamicConfig,
    backoff::{Backoff, BackoffDecision},
    clock::{Clock, Deadline, MonotonicClock},
    config::{RetryPolicy, TaskConfig},
    error::{TaskError, StatusCode, ServerErrorCode},
    executor::{CallbackExecutor, WorkerPool},
    jitter::Jitter,
    owner::{MonitoredTask, OwnerResource, TaskTracker},
    picker::{NodeId, NodeRegistry, PartitionId, PickLeader, PickSpecificNode, ReplicaPicker},
    scheduler::{Scheduler, TokioScheduler},
    state::{TaskId, TaskKind, TaskState},
    task::{AttemptContext, Dispatch, Outcome, RemoteOperation, RetryingTask, TaskEnv},
    telemetry::{LogSink, MemorySink, Telemetry, TaskEvent},
    throttle::{BulkheadThrottler, TaskThrottler},
};
