//! The retrying task state machine.
//!
//! A [`RetryingTask`] drives one [`RemoteOperation`] against a storage node until the operation
//! takes effect, fails terminally, runs out of retries or time, or is aborted:
//!
//! 1. [`RetryingTask::run`] bumps the attempt counter, resolves the target through the task's
//!    [`ReplicaPicker`] and opens a connection for every service the operation uses.
//! 2. It moves `Waiting → Running`, takes a throttler slot and asks the operation to send.
//! 3. The response future completes on the runtime; the slot is released and the response is
//!    handed to the [`CallbackExecutor`], where the operation classifies it.
//! 4. Retryable outcomes go through the backoff and the [`Scheduler`]; terminal ones unregister
//!    the task from its owner.
//!
//! Strong references to a task are held by the caller and by pending continuations (the timer
//! callback, the response future, the queued handler). Owners only hold weak ones.
//!
//! ```rust,no_run
//! use remote_tasks::prelude::*;
//! use std::sync::Arc;
//!
//! # fn demo<Op: RemoteOperation>(op: Op, env: TaskEnv, registry: Arc<dyn NodeRegistry>) {
//! let owner = TaskTracker::new("table-1");
//! let picker = PickSpecificNode::new(registry, NodeId::new("ts-1"));
//! let task = RetryingTask::builder(op, picker, env).owner(owner.clone()).build();
//! if let Err(e) = task.run() {
//!     tracing::warn!(error = %e, "task failed to start");
//! }
//! # }
//! ```

use crate::adaptive::DynamicConfig;
use crate::backoff::{Backoff, BackoffDecision};
use crate::clock::{Clock, Deadline, MonotonicClock};
use crate::config::{RetryPolicy, TaskConfig};
use crate::error::TaskError;
use crate::executor::{CallbackExecutor, Job};
use crate::jitter::Jitter;
use crate::owner::{MonitoredTask, OwnerResource};
use crate::picker::{ConnectionProxy, NodeHandle, NodeId, ReplicaPicker, ServiceKind};
use crate::scheduler::{Scheduler, TimerId};
use crate::state::{AtomicTaskState, TaskId, TaskKind, TaskState};
use crate::telemetry::{TaskEvent, Telemetry};
use crate::throttle::{TaskThrottler, ThrottlePermit};
use futures::future::BoxFuture;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Result of [`RemoteOperation::send_request`].
pub enum Dispatch<R> {
    /// The request is on the wire; the future resolves with the response.
    Sent(BoxFuture<'static, Result<R, TaskError>>),
    /// Nothing was sent; retry after the usual backoff.
    NotSent,
    /// The operation can no longer succeed; abort the task without sending.
    Abort(TaskError),
}

impl<R> fmt::Debug for Dispatch<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Sent(_) => f.write_str("Sent(..)"),
            Dispatch::NotSent => f.write_str("NotSent"),
            Dispatch::Abort(e) => f.debug_tuple("Abort").field(e).finish(),
        }
    }
}

/// Classification of one attempt's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation took effect, or had already taken effect.
    Complete,
    /// Retrying cannot help.
    Failed(TaskError),
    /// Try again after backoff.
    Retry,
    /// Stop immediately, as if cancelled.
    Abort(TaskError),
}

/// Everything an operation needs to know about the attempt in progress.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    task: TaskId,
    attempt: u32,
    target: NodeHandle,
    connections: Vec<ConnectionProxy>,
    deadline: Deadline,
}

impl AttemptContext {
    pub(crate) fn new(
        task: TaskId,
        attempt: u32,
        target: NodeHandle,
        connections: Vec<ConnectionProxy>,
        deadline: Deadline,
    ) -> Self {
        Self { task, attempt, target, connections, deadline }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn target(&self) -> &NodeHandle {
        &self.target
    }

    /// Connection for `service`, if the operation declared it.
    pub fn connection(&self, service: ServiceKind) -> Result<&ConnectionProxy, TaskError> {
        self.connections.iter().find(|c| c.service() == service).ok_or_else(|| {
            TaskError::IllegalState(format!("no {service:?} connection opened for this attempt"))
        })
    }

    /// Earlier of the per-attempt timeout and the task deadline.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}

/// Final state of a task, passed to [`RemoteOperation::on_unregistered`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutcome {
    pub task: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<TaskError>,
    pub target: Option<NodeId>,
}

/// A concrete remote operation driven by a [`RetryingTask`].
pub trait RemoteOperation: Send + Sync + 'static {
    type Response: Send + 'static;

    fn kind(&self) -> TaskKind;

    /// Human-readable description; `target` is the node resolved by the latest attempt.
    fn description(&self, target: Option<&NodeId>) -> String;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::RetryLimited
    }

    /// Services a connection must be opened to before every attempt.
    fn services(&self) -> &'static [ServiceKind] {
        &[ServiceKind::Admin]
    }

    /// Absolute deadline of the whole task, computed once at construction.
    fn deadline(&self, now_millis: u64, config: &TaskConfig) -> Deadline {
        Deadline::after(now_millis, config.unresponsive_timeout())
    }

    /// Issue the request for this attempt.
    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<Self::Response>;

    /// Classify the result of an attempt. Runs on the callback executor and may block.
    fn handle_response(
        &self,
        ctx: &AttemptContext,
        result: Result<Self::Response, TaskError>,
    ) -> Outcome;

    /// Side effects that must run after the task left its owner's outstanding set.
    fn on_unregistered(&self, _outcome: &TerminalOutcome) {}
}

/// Shared services used by every task.
#[derive(Clone)]
pub struct TaskEnv {
    runtime: Handle,
    scheduler: Arc<dyn Scheduler>,
    executor: Arc<dyn CallbackExecutor>,
    clock: Arc<dyn Clock>,
    config: DynamicConfig<TaskConfig>,
    telemetry: Telemetry,
    jitter: Jitter,
}

impl fmt::Debug for TaskEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnv")
            .field("scheduler", &self.scheduler)
            .field("executor", &self.executor)
            .field("clock", &self.clock)
            .field("config", &self.config.get())
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl TaskEnv {
    /// Environment with default config, monotonic clock, default jitter and no telemetry.
    pub fn new(
        runtime: Handle,
        scheduler: Arc<dyn Scheduler>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Self {
        Self {
            runtime,
            scheduler,
            executor,
            clock: Arc::new(MonotonicClock::default()),
            config: DynamicConfig::new(TaskConfig::default()),
            telemetry: Telemetry::default(),
            jitter: Jitter::default(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_config(mut self, config: DynamicConfig<TaskConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &DynamicConfig<TaskConfig> {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    unregistered: bool,
    end_millis: Option<u64>,
}

/// Retry state machine around one [`RemoteOperation`].
pub struct RetryingTask<Op: RemoteOperation> {
    id: TaskId,
    op: Op,
    picker: Box<dyn ReplicaPicker>,
    throttler: Option<Arc<dyn TaskThrottler>>,
    owner: Option<Weak<dyn OwnerResource>>,
    env: TaskEnv,
    state: AtomicTaskState,
    attempt: AtomicU32,
    start_millis: u64,
    attempt_start_millis: AtomicU64,
    deadline: Deadline,
    target: Mutex<Option<NodeHandle>>,
    // 0 when no retry timer is pending.
    timer: AtomicU64,
    error: Mutex<Option<TaskError>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<Op: RemoteOperation> fmt::Debug for RetryingTask<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingTask")
            .field("id", &self.id)
            .field("kind", &self.op.kind())
            .field("state", &self.state())
            .field("attempt", &self.attempt())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RetryingTask`].
pub struct TaskBuilder<Op: RemoteOperation> {
    op: Op,
    picker: Box<dyn ReplicaPicker>,
    env: TaskEnv,
    throttler: Option<Arc<dyn TaskThrottler>>,
    owner: Option<Arc<dyn OwnerResource>>,
}

impl<Op: RemoteOperation> TaskBuilder<Op> {
    /// Gate sends through `throttler`.
    pub fn throttler(mut self, throttler: Arc<dyn TaskThrottler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Register the task with `owner` on build.
    pub fn owner(mut self, owner: Arc<dyn OwnerResource>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn build(self) -> Arc<RetryingTask<Op>> {
        let now = self.env.now_millis();
        let deadline = self.op.deadline(now, &self.env.config.get());
        let task = Arc::new(RetryingTask {
            id: TaskId::next(),
            op: self.op,
            picker: self.picker,
            throttler: self.throttler,
            owner: self.owner.as_ref().map(Arc::downgrade),
            env: self.env,
            state: AtomicTaskState::new(TaskState::Waiting),
            attempt: AtomicU32::new(0),
            start_millis: now,
            attempt_start_millis: AtomicU64::new(now),
            deadline,
            target: Mutex::new(None),
            timer: AtomicU64::new(0),
            error: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        if let Some(owner) = &self.owner {
            let weak: Weak<dyn MonitoredTask> = Arc::downgrade(&task) as Weak<dyn MonitoredTask>;
            owner.register_task(task.id, weak);
        }
        debug!(task = %task.description(), id = %task.id, ?deadline, "task created");
        task
    }
}

impl<Op: RemoteOperation> RetryingTask<Op> {
    pub fn builder<P>(op: Op, picker: P, env: TaskEnv) -> TaskBuilder<Op>
    where
        P: ReplicaPicker + 'static,
    {
        TaskBuilder { op, picker: Box::new(picker), env, throttler: None, owner: None }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.op.kind()
    }

    pub fn operation(&self) -> &Op {
        &self.op
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Number of attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    pub fn attempt_start_millis(&self) -> u64 {
        self.attempt_start_millis.load(Ordering::Acquire)
    }

    /// Set once the task unregistered.
    pub fn end_millis(&self) -> Option<u64> {
        self.lifecycle().end_millis
    }

    pub fn is_unregistered(&self) -> bool {
        self.lifecycle().unregistered
    }

    /// Node resolved by the most recent attempt.
    pub fn target(&self) -> Option<NodeHandle> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Error recorded with the terminal transition, if any.
    pub fn last_error(&self) -> Option<TaskError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.load(Ordering::Acquire) != 0
    }

    pub fn description(&self) -> String {
        let target = self.target();
        self.op.description(target.as_ref().map(|t| t.id()))
    }

    /// Start an attempt. Progress is asynchronous; an error is returned only when this call
    /// itself could not get the attempt going (aborted task, terminal resolution failure).
    pub fn run(self: &Arc<Self>) -> Result<(), TaskError> {
        let now = self.env.now_millis();
        self.attempt_start_millis.store(now, Ordering::Release);
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(task = %self.description(), id = %self.id, attempt, "start running");

        loop {
            match self.state() {
                TaskState::Waiting => break,
                TaskState::Aborted => {
                    return Err(TaskError::Aborted(
                        "unable to run task because it has been aborted".into(),
                    ));
                }
                // A retry is being scheduled on another thread; it flips to Waiting right after.
                TaskState::Scheduling => std::thread::yield_now(),
                other => {
                    error!(
                        task = %self.description(),
                        id = %self.id,
                        state = %other,
                        "run called on a task that is not waiting"
                    );
                    return Err(TaskError::IllegalState(format!("task in state {other}")));
                }
            }
        }

        let cfg = self.env.config.get();
        let ctx = match self.resolve_target(attempt, now, &cfg) {
            Ok(ctx) => ctx,
            Err(e) => return self.on_resolution_failure(e),
        };

        if let Err(observed) = self.state.compare_exchange(TaskState::Waiting, TaskState::Running)
        {
            if observed == TaskState::Aborted {
                return Err(TaskError::Aborted(
                    "unable to run task because it has been aborted".into(),
                ));
            }
            error!(
                task = %self.description(),
                id = %self.id,
                state = %observed,
                "transition waiting -> running failed"
            );
            return Err(TaskError::IllegalState(format!("task in state {observed}")));
        }
        self.timer.store(0, Ordering::Release);

        let permit = match &self.throttler {
            None => None,
            Some(throttler) => match ThrottlePermit::try_acquire(throttler) {
                Some(permit) => Some(permit),
                None => {
                    debug!(task = %self.description(), id = %self.id, attempt, "throttled request");
                    self.env.telemetry.emit(TaskEvent::Throttled {
                        id: self.id,
                        kind: self.kind(),
                        attempt,
                    });
                    if !self.reschedule_with_backoff() {
                        self.unregister();
                    }
                    return Ok(());
                }
            },
        };

        self.env.telemetry.emit(TaskEvent::AttemptStarted {
            id: self.id,
            kind: self.kind(),
            attempt,
            target: ctx.target.id().clone(),
        });

        match self.op.send_request(&ctx) {
            Dispatch::Sent(response) => self.await_response(response, ctx, permit, now),
            Dispatch::NotSent => {
                drop(permit);
                debug!(task = %self.description(), id = %self.id, attempt, "request not sent");
                if !self.reschedule_with_backoff() {
                    self.unregister();
                }
            }
            Dispatch::Abort(reason) => {
                drop(permit);
                self.abort_with(reason);
            }
        }
        Ok(())
    }

    /// Cooperatively cancel the task. Returns the state the abort replaced, or the terminal
    /// state the task had already reached.
    pub fn abort(&self, reason: impl Into<String>) -> TaskState {
        self.abort_with(TaskError::Aborted(reason.into()))
    }

    fn abort_with(&self, reason: TaskError) -> TaskState {
        let mut prev = self.state();
        while !prev.is_terminal() {
            match self.state.compare_exchange_weak(prev, TaskState::Aborted) {
                Ok(_) => {
                    info!(
                        task = %self.description(),
                        id = %self.id,
                        prev = %prev,
                        reason = %reason,
                        "task aborted"
                    );
                    self.abort_if_scheduled();
                    self.finished(Some(reason));
                    self.unregister();
                    return prev;
                }
                Err(observed) => prev = observed,
            }
        }
        debug!(task = %self.description(), id = %self.id, state = %prev, "already terminal");
        self.unregister();
        prev
    }

    fn resolve_target(
        &self,
        attempt: u32,
        now: u64,
        cfg: &TaskConfig,
    ) -> Result<AttemptContext, TaskError> {
        let target = self.picker.pick_replica()?;
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        let connections = self
            .op
            .services()
            .iter()
            .map(|service| target.connect(*service))
            .collect::<Result<Vec<_>, _>>()?;
        let deadline = Deadline::after(now, cfg.rpc_timeout()).earliest(self.deadline);
        Ok(AttemptContext::new(self.id, attempt, target, connections, deadline))
    }

    fn on_resolution_failure(self: &Arc<Self>, e: TaskError) -> Result<(), TaskError> {
        info!(task = %self.description(), id = %self.id, error = %e, "failed to resolve target");
        if matches!(e, TaskError::Expired(_)) {
            self.transition_to_terminal(TaskState::Waiting, TaskState::Failed, Some(e.clone()));
            self.unregister();
            return Err(e);
        }
        if self.reschedule_with_backoff() {
            return Ok(());
        }
        self.unregister();
        match self.state() {
            TaskState::Aborted => Err(TaskError::Aborted(
                "unable to run task because it has been aborted".into(),
            )),
            _ => Err(self.last_error().unwrap_or(e)),
        }
    }

    fn await_response(
        self: &Arc<Self>,
        response: BoxFuture<'static, Result<Op::Response, TaskError>>,
        ctx: AttemptContext,
        permit: Option<ThrottlePermit>,
        now: u64,
    ) {
        let budget = match ctx.deadline {
            Deadline::Never => None,
            deadline => Some(Duration::from_millis(deadline.remaining_millis(now).max(0) as u64)),
        };
        let task = Arc::clone(self);
        self.env.runtime.spawn(async move {
            let result = match budget {
                Some(budget) => match tokio::time::timeout(budget, response).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::RpcTimedOut(budget)),
                },
                None => response.await,
            };
            task.rpc_callback(permit, ctx, result);
        });
    }

    /// Runs on the runtime: must not block.
    fn rpc_callback(
        self: &Arc<Self>,
        permit: Option<ThrottlePermit>,
        ctx: AttemptContext,
        result: Result<Op::Response, TaskError>,
    ) {
        drop(permit);
        let task = Arc::clone(self);
        let job: Job = Box::new(move || task.do_rpc_callback(ctx, result));
        if let Err(e) = self.env.executor.submit(job) {
            warn!(
                task = %self.description(),
                id = %self.id,
                error = %e,
                "could not submit response handler, probably shutting down"
            );
            self.abort_with(e);
        }
    }

    fn do_rpc_callback(
        self: &Arc<Self>,
        ctx: AttemptContext,
        result: Result<Op::Response, TaskError>,
    ) {
        let latency = self.env.now_millis().saturating_sub(self.attempt_start_millis());
        self.env.telemetry.emit(TaskEvent::AttemptFinished {
            id: self.id,
            kind: self.kind(),
            attempt: ctx.attempt,
            success: result.is_ok(),
            latency: Duration::from_millis(latency),
        });

        if let Err(e) = &result {
            warn!(
                task = %self.description(),
                id = %self.id,
                node = %ctx.target.id(),
                attempt = ctx.attempt,
                error = %e,
                "{} request failed",
                self.kind()
            );
        }

        if self.state() != TaskState::Aborted {
            match catch_unwind(AssertUnwindSafe(|| self.op.handle_response(&ctx, result))) {
                Ok(outcome) => self.apply_outcome(outcome),
                Err(_) => {
                    error!(
                        task = %self.description(),
                        id = %self.id,
                        attempt = ctx.attempt,
                        "response handler panicked"
                    );
                    self.abort_with(TaskError::IllegalState("response handler panicked".into()));
                }
            }
        }

        if self.reschedule_with_backoff() {
            return;
        }
        self.unregister();
    }

    fn apply_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Complete => {
                self.transition_to_terminal(TaskState::Running, TaskState::Complete, None)
            }
            Outcome::Failed(e) => {
                self.transition_to_terminal(TaskState::Running, TaskState::Failed, Some(e))
            }
            Outcome::Retry => {
                debug!(task = %self.description(), id = %self.id, "response is retryable")
            }
            Outcome::Abort(e) => {
                self.abort_with(e);
            }
        }
    }

    /// Schedule the next attempt. Returns `false` when no retry was scheduled; the caller then
    /// unregisters the task.
    fn reschedule_with_backoff(self: &Arc<Self>) -> bool {
        let state = self.state();
        if state != TaskState::Running && state != TaskState::Waiting {
            if state != TaskState::Complete {
                info!(task = %self.description(), id = %self.id, state = %state, "no reschedule");
            }
            return false;
        }

        let cfg = self.env.config.get();
        let attempt = self.attempt();
        let threshold = self.op.retry_policy().attempt_threshold(&cfg);
        if attempt > threshold {
            let e = TaskError::RetriesExhausted { attempts: attempt, threshold };
            warn!(task = %self.description(), id = %self.id, error = %e, "giving up");
            self.transition_to_terminal(state, TaskState::Failed, Some(e));
            return false;
        }

        let backoff = Backoff::new(cfg.max_delay()).with_jitter(self.env.jitter);
        let delay = match backoff.next_delay(attempt, self.env.now_millis(), self.deadline) {
            BackoffDecision::Retry(delay) => delay,
            BackoffDecision::TimedOut => {
                let e = TaskError::TimedOut { attempts: attempt };
                warn!(task = %self.description(), id = %self.id, error = %e, "deadline reached");
                self.transition_to_terminal(state, TaskState::Failed, Some(e));
                return false;
            }
        };

        info!(
            task = %self.description(),
            id = %self.id,
            delay_ms = delay.as_millis() as u64,
            attempt,
            threshold,
            "scheduling retry"
        );

        if self.state.compare_exchange(state, TaskState::Scheduling).is_err() {
            warn!(task = %self.description(), id = %self.id, "unable to mark task as scheduling");
            return false;
        }

        let task = Arc::clone(self);
        let timer = self
            .env
            .scheduler
            .schedule_after(delay, Box::new(move |status| task.run_delayed(status)));
        let Some(timer) = timer else {
            self.abort_with(TaskError::ShuttingDown("scheduler closing".into()));
            return false;
        };
        self.timer.store(timer.as_u64(), Ordering::Release);
        self.env.telemetry.emit(TaskEvent::RetryScheduled {
            id: self.id,
            kind: self.kind(),
            attempt,
            delay,
        });

        self.transition_to_waiting(TaskState::Scheduling)
    }

    fn run_delayed(self: &Arc<Self>, status: Result<(), TaskError>) {
        if self.state() == TaskState::Aborted {
            self.unregister();
            return;
        }
        if let Err(e) = status {
            warn!(task = %self.description(), id = %self.id, error = %e, "retry timer cancelled");
            self.abort_with(e);
            return;
        }
        if let Err(e) = self.run() {
            warn!(task = %self.description(), id = %self.id, error = %e, "retry attempt failed");
        }
    }

    fn transition_to_waiting(&self, expected: TaskState) -> bool {
        match self.state.compare_exchange(expected, TaskState::Waiting) {
            Ok(_) => true,
            Err(observed) => {
                if observed != TaskState::Aborted {
                    error!(
                        task = %self.description(),
                        id = %self.id,
                        state = %observed,
                        "unable to mark task as waiting"
                    );
                }
                self.abort_if_scheduled();
                false
            }
        }
    }

    fn transition_to_terminal(
        &self,
        expected: TaskState,
        terminal: TaskState,
        error: Option<TaskError>,
    ) {
        if let Err(observed) = self.state.compare_exchange(expected, terminal) {
            if terminal != TaskState::Aborted && observed == TaskState::Aborted {
                warn!(
                    task = %self.description(),
                    id = %self.id,
                    "unable to perform transition {expected} -> {terminal}: task has been aborted"
                );
            } else {
                error!(
                    task = %self.description(),
                    id = %self.id,
                    state = %observed,
                    "state transition {expected} -> {terminal} failed"
                );
            }
            return;
        }
        self.finished(error);
    }

    fn finished(&self, error: Option<TaskError>) {
        match &error {
            None => info!(task = %self.description(), id = %self.id, "task complete"),
            Some(e) => {
                warn!(task = %self.description(), id = %self.id, error = %e, "task finished")
            }
        }
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn abort_if_scheduled(&self) {
        let raw = self.timer.swap(0, Ordering::AcqRel);
        if let Some(timer) = TimerId::from_u64(raw) {
            debug!(id = %self.id, timer = raw, "cancelling retry timer");
            self.env.scheduler.cancel(timer);
        }
    }

    /// Leave the owner's outstanding set. Effects run at most once and only in a terminal state.
    fn unregister(&self) {
        let state = self.state();
        let end = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.unregistered {
                return;
            }
            if !state.is_terminal() {
                error!(
                    task = %self.description(),
                    id = %self.id,
                    state = %state,
                    "refusing to unregister a task that is not terminal"
                );
                return;
            }
            let end = self.env.now_millis();
            lifecycle.unregistered = true;
            lifecycle.end_millis = Some(end);
            end
        };

        let attempts = self.attempt();
        self.env.telemetry.emit(TaskEvent::Terminal {
            id: self.id,
            kind: self.kind(),
            state,
            attempts,
            duration: Duration::from_millis(end.saturating_sub(self.start_millis)),
        });

        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            if owner.remove_task(self.id) {
                owner.on_all_tasks_drained();
            }
        }

        let outcome = TerminalOutcome {
            task: self.id,
            state,
            attempts,
            error: self.last_error(),
            target: self.target().map(|t| t.id().clone()),
        };
        self.op.on_unregistered(&outcome);
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<Op: RemoteOperation> MonitoredTask for RetryingTask<Op> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> TaskKind {
        self.op.kind()
    }

    fn state(&self) -> TaskState {
        RetryingTask::state(self)
    }

    fn description(&self) -> String {
        RetryingTask::description(self)
    }

    fn abort(&self, reason: &str) -> TaskState {
        RetryingTask::abort(self, reason)
    }
}

impl<Op: RemoteOperation> Drop for RetryingTask<Op> {
    fn drop(&mut self) {
        let unregistered =
            self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner).unregistered;
        if unregistered {
            return;
        }
        // Dropped before it could unregister; the owner must not keep waiting for it.
        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            warn!(
                id = %self.id,
                kind = %self.op.kind(),
                state = %self.state(),
                "task dropped before it finished"
            );
            if owner.remove_task(self.id) {
                owner.on_all_tasks_drained();
            }
        }
    }
}
