//! Task identity and the lock-free lifecycle state.
//!
//! ```text
//!            run()                      response
//!  Waiting ────────► Running ───────────────────────► Complete | Failed
//!     ▲                 │ retryable
//!     │   scheduled     ▼
//!     └──────────── Scheduling
//!
//!  any non-terminal ──abort()──► Aborted
//! ```
//!
//! Transitions go through `compare_exchange` so a concurrent abort and the normal progression of
//! a task race safely: whichever commits first wins, and terminal states never change again.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const STATE_SCHEDULING: u8 = 0;
const STATE_WAITING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_COMPLETE: u8 = 3;
const STATE_FAILED: u8 = 4;
const STATE_ABORTED: u8 = 5;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    /// Transitional: a retry is being handed to the scheduler.
    Scheduling,
    /// Idle and eligible to run.
    Waiting,
    /// A request is in flight.
    Running,
    /// Terminal success.
    Complete,
    /// Terminal failure.
    Failed,
    /// Terminal, cancelled.
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed | TaskState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduling => "scheduling",
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            TaskState::Scheduling => STATE_SCHEDULING,
            TaskState::Waiting => STATE_WAITING,
            TaskState::Running => STATE_RUNNING,
            TaskState::Complete => STATE_COMPLETE,
            TaskState::Failed => STATE_FAILED,
            TaskState::Aborted => STATE_ABORTED,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn u8_to_state(v: u8) -> Option<TaskState> {
    match v {
        STATE_SCHEDULING => Some(TaskState::Scheduling),
        STATE_WAITING => Some(TaskState::Waiting),
        STATE_RUNNING => Some(TaskState::Running),
        STATE_COMPLETE => Some(TaskState::Complete),
        STATE_FAILED => Some(TaskState::Failed),
        STATE_ABORTED => Some(TaskState::Aborted),
        _ => None,
    }
}

/// Atomic cell holding a [`TaskState`].
#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub(crate) fn load(&self) -> TaskState {
        // Only valid encodings are ever stored.
        u8_to_state(self.0.load(Ordering::Acquire)).unwrap_or(TaskState::Aborted)
    }

    /// Swap `current` for `new`; on failure returns the state actually observed.
    pub(crate) fn compare_exchange(
        &self,
        current: TaskState,
        new: TaskState,
    ) -> Result<TaskState, TaskState> {
        self.0
            .compare_exchange(current.to_u8(), new.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| current)
            .map_err(|observed| u8_to_state(observed).unwrap_or(TaskState::Aborted))
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: TaskState,
        new: TaskState,
    ) -> Result<TaskState, TaskState> {
        self.0
            .compare_exchange_weak(
                current.to_u8(),
                new.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| current)
            .map_err(|observed| u8_to_state(observed).unwrap_or(TaskState::Aborted))
    }
}

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id from its raw value, e.g. one read back from logs.
    pub fn from_raw(id: u64) -> Self {
        TaskId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Operation tag used in logs and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TaskKind {
    CreateReplica,
    DeleteReplica,
    AddServer,
    RemoveServer,
    LeaderStepDown,
    SplitTablet,
    AlterSchema,
    AddTableToTablet,
    RemoveTableFromTablet,
    /// Operations defined outside this crate.
    Custom(&'static str),
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateReplica => "CreateReplica",
            TaskKind::DeleteReplica => "DeleteReplica",
            TaskKind::AddServer => "AddServer",
            TaskKind::RemoveServer => "RemoveServer",
            TaskKind::LeaderStepDown => "LeaderStepDown",
            TaskKind::SplitTablet => "SplitTablet",
            TaskKind::AlterSchema => "AlterSchema",
            TaskKind::AddTableToTablet => "AddTableToTablet",
            TaskKind::RemoveTableFromTablet => "RemoveTableFromTablet",
            TaskKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
