//! Task-level state store.
//!
//! The `TaskOrchestrator` is the sole mutator of task status and
//! assignment. Claiming a task acquires its file locks; every transition out
//! of claimed/running releases them in the same step, under the task table
//! mutex. Lock order is always task table, then lock table.

use crate::core::{Capability, Task, TaskId, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::locks::{LockManager, LockOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatistics {
    pub total: usize,
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

impl TaskTable {
    fn get_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))
    }

    fn missing_dependencies(&self, task: &Task) -> Vec<TaskId> {
        let mut missing: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| !self.tasks.get(*dep).is_some_and(Task::is_completed))
            .copied()
            .collect();
        missing.sort();
        missing
    }
}

fn transition_error(task: &Task, to: &str) -> Error {
    Error::InvalidTransition {
        from: task.status.name().to_string(),
        to: to.to_string(),
    }
}

pub struct TaskOrchestrator {
    table: Mutex<TaskTable>,
    locks: Arc<LockManager>,
}

impl TaskOrchestrator {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self {
            table: Mutex::new(TaskTable::default()),
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn add_task(&self, task: Task) -> Result<()> {
        let mut table = self.table.lock();
        if table.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!(
                "Task {} already exists",
                task.id
            )));
        }
        debug!(task = %task.id.short(), title = %task.title, "task added");
        table.order.push(task.id);
        table.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.table.lock().tasks.contains_key(&id)
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.table.lock().tasks.get(&id).cloned()
    }

    /// Every task, in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.tasks.get(id))
            .cloned()
            .collect()
    }

    /// Dependencies of `id` that are not yet completed.
    pub fn missing_dependencies(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let table = self.table.lock();
        let task = table.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        Ok(table.missing_dependencies(task))
    }

    /// Reserve a pending task for `worker` and lock its files.
    ///
    /// Nothing changes when the claim is refused.
    ///
    /// # Errors
    /// `DependencyUnmet` when a dependency is not completed, `Conflict` when
    /// another task holds one of its files.
    pub fn claim_task(&self, worker: WorkerId, id: TaskId) -> Result<Task> {
        let mut table = self.table.lock();
        let task = table.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
        if task.status != TaskStatus::Pending {
            return Err(transition_error(task, "claimed"));
        }

        let missing = table.missing_dependencies(task);
        if !missing.is_empty() {
            return Err(Error::DependencyUnmet {
                task_id: id,
                missing,
            });
        }

        let conflicting: Vec<_> = self
            .locks
            .check_conflicts(&task.files_touched)
            .into_iter()
            .filter(|lock| lock.holder_task != id)
            .map(|lock| lock.resource_path)
            .collect();
        if !conflicting.is_empty() {
            return Err(Error::Conflict {
                task_id: id,
                paths: conflicting,
            });
        }

        if let LockOutcome::Conflict(locks) =
            self.locks.acquire_locks(id, worker, &task.files_touched)
        {
            return Err(Error::Conflict {
                task_id: id,
                paths: locks.into_iter().map(|l| l.resource_path).collect(),
            });
        }

        let task = table.get_mut(id)?;
        task.claim(worker);
        debug!(task = %id.short(), worker = %worker.short(), "task claimed");
        Ok(task.clone())
    }

    /// Hand a claimed task back to pending without counting a retry.
    pub fn unclaim_task(&self, id: TaskId) -> Result<()> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if task.status != TaskStatus::Claimed {
            return Err(transition_error(task, "pending"));
        }
        task.status = TaskStatus::Pending;
        task.assigned_worker = None;
        self.locks.release_locks(id);
        Ok(())
    }

    pub fn start_task(&self, id: TaskId) -> Result<()> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if task.status != TaskStatus::Claimed {
            return Err(transition_error(task, "running"));
        }
        task.start();
        Ok(())
    }

    /// Finish an in-flight task and release its locks.
    pub fn complete_task(&self, id: TaskId, success: bool) -> Result<Task> {
        if !success {
            return self.fail_task(id, "execution failed");
        }
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if !task.is_in_flight() {
            return Err(transition_error(task, "completed"));
        }
        task.complete();
        self.locks.release_locks(id);
        info!(task = %id.short(), title = %task.title, "task completed");
        Ok(task.clone())
    }

    pub fn fail_task(&self, id: TaskId, error: &str) -> Result<Task> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if !task.is_in_flight() {
            return Err(transition_error(task, "failed"));
        }
        task.fail(error);
        self.locks.release_locks(id);
        debug!(task = %id.short(), error, "task failed");
        Ok(task.clone())
    }

    /// Force-fail an in-flight task that ran longer than `after`.
    pub fn time_out_task(&self, id: TaskId, after: Duration) -> Result<Task> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if !task.is_in_flight() {
            return Err(transition_error(task, "timed_out"));
        }
        task.time_out();
        self.locks.release_locks(id);
        warn!(task = %id.short(), title = %task.title, after = ?after, "task timed out");
        Ok(task.clone())
    }

    /// Put a failed or timed out task back to pending with one more retry.
    pub fn requeue_task(&self, id: TaskId) -> Result<Task> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        if !matches!(task.status, TaskStatus::Failed { .. } | TaskStatus::TimedOut) {
            return Err(transition_error(task, "pending"));
        }
        task.requeue();
        Ok(task.clone())
    }

    /// Mark a task that will never run again as failed.
    ///
    /// Accepts pending tasks (dependency cascade) as well as failed or
    /// timed out ones whose retries are exhausted.
    pub fn fail_terminal(&self, id: TaskId, error: &str) -> Result<Task> {
        let mut table = self.table.lock();
        let task = table.get_mut(id)?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Failed { .. } | TaskStatus::TimedOut => {
                task.fail(error);
                self.locks.release_locks(id);
                Ok(task.clone())
            }
            _ => Err(transition_error(task, "failed")),
        }
    }

    /// Heartbeat for a running task's locks.
    pub fn heartbeat(&self, id: TaskId) -> bool {
        self.locks.renew_locks(id)
    }

    pub fn cleanup_expired_locks(&self) -> usize {
        self.locks.cleanup_expired_locks()
    }

    /// Pending tasks whose dependencies are completed and whose required
    /// skills intersect `skills`. A task without requirements matches any
    /// worker. Ordered by priority, then creation.
    pub fn available_tasks(&self, skills: &BTreeSet<Capability>) -> Vec<Task> {
        let table = self.table.lock();
        let mut available: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.required_skills.is_empty() || !t.required_skills.is_disjoint(skills))
            .filter(|t| table.missing_dependencies(t).is_empty())
            .cloned()
            .collect();
        available.sort_by_key(Task::order_key);
        available
    }

    /// Every task that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: TaskId) -> Vec<TaskId> {
        let table = self.table.lock();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut found = Vec::new();
        let mut frontier = VecDeque::from([id]);
        while let Some(current) = frontier.pop_front() {
            for other in &table.order {
                let Some(task) = table.tasks.get(other) else {
                    continue;
                };
                if task.dependencies.contains(&current) && seen.insert(*other) {
                    found.push(*other);
                    frontier.push_back(*other);
                }
            }
        }
        found
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        let table = self.table.lock();
        let mut stats = OrchestratorStatistics {
            total: table.tasks.len(),
            ..Default::default()
        };
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Claimed => stats.claimed += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::TimedOut => stats.timed_out += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("tasks", &self.table.lock().tasks.len())
            .field("locks", &self.locks)
            .finish()
    }
}
