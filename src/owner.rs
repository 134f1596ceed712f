//! Resources that own outstanding tasks.
//!
//! A resource (a table, typically) keeps weak references to the tasks working on it so it can
//! enumerate and abort them on teardown. Tasks remove themselves when they unregister; the last
//! one out triggers [`OwnerResource::on_all_tasks_drained`].

use crate::state::{TaskId, TaskKind, TaskState};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

/// Read-only view of a task plus cooperative cancellation.
pub trait MonitoredTask: Send + Sync + fmt::Debug {
    fn id(&self) -> TaskId;
    fn kind(&self) -> TaskKind;
    fn state(&self) -> TaskState;
    fn description(&self) -> String;
    /// Abort the task; returns the state it was in before the abort won (or the terminal state
    /// it had already reached).
    fn abort(&self, reason: &str) -> TaskState;
}

/// Owner side of task registration.
pub trait OwnerResource: Send + Sync + fmt::Debug {
    fn register_task(&self, id: TaskId, task: Weak<dyn MonitoredTask>);
    /// Forget a task. Returns `true` if no outstanding task remains afterwards.
    fn remove_task(&self, id: TaskId) -> bool;
    /// Called by the task whose removal emptied the outstanding set.
    fn on_all_tasks_drained(&self);
}

/// Outstanding-task set for one resource.
pub struct TaskTracker {
    name: String,
    tasks: Mutex<HashMap<TaskId, Weak<dyn MonitoredTask>>>,
    pending_delete: AtomicBool,
    deleted: AtomicBool,
    drained: Notify,
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("name", &self.name)
            .field("outstanding", &self.outstanding())
            .field("pending_delete", &self.is_pending_delete())
            .finish()
    }
}

impl TaskTracker {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tasks: Mutex::new(HashMap::new()),
            pending_delete: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Live tasks, in no particular order. Entries whose task is gone are pruned; if that empties
    /// the set, the drained hook fires.
    pub fn tasks(&self) -> Vec<Arc<dyn MonitoredTask>> {
        let mut live = Vec::new();
        let emptied = {
            let mut tasks = self.lock();
            let before = tasks.len();
            tasks.retain(|id, weak| match weak.upgrade() {
                Some(task) => {
                    live.push(task);
                    true
                }
                None => {
                    tracing::warn!(owner = %self.name, %id, "pruning task that no longer exists");
                    false
                }
            });
            before > 0 && tasks.is_empty()
        };
        if emptied {
            self.on_all_tasks_drained();
        }
        live
    }

    /// Abort every outstanding task. Returns how many were asked to abort.
    pub fn abort_all(&self, reason: &str) -> usize {
        let tasks = self.tasks();
        for task in &tasks {
            let prev = task.abort(reason);
            tracing::debug!(
                owner = %self.name,
                task = %task.description(),
                prev = %prev,
                "aborted outstanding task"
            );
        }
        tracing::info!(owner = %self.name, aborted = tasks.len(), reason, "aborted all tasks");
        tasks.len()
    }

    /// Mark the resource for deletion; it is deleted once no task remains.
    pub fn mark_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
        if self.tasks().is_empty() {
            self.on_all_tasks_drained();
        }
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Wait until no outstanding task remains.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.tasks().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Weak<dyn MonitoredTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OwnerResource for TaskTracker {
    fn register_task(&self, id: TaskId, task: Weak<dyn MonitoredTask>) {
        if self.lock().insert(id, task).is_some() {
            tracing::error!(owner = %self.name, %id, "task registered twice");
        }
    }

    fn remove_task(&self, id: TaskId) -> bool {
        let mut tasks = self.lock();
        if tasks.remove(&id).is_none() {
            tracing::warn!(owner = %self.name, %id, "removing unknown task");
            return false;
        }
        tasks.is_empty()
    }

    fn on_all_tasks_drained(&self) {
        self.drained.notify_waiters();
        if self.is_pending_delete() && !self.deleted.swap(true, Ordering::AcqRel) {
            tracing::info!(owner = %self.name, "last task finished; resource deleted");
        }
    }
}
