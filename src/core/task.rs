//! Task data model.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, assignment, the files it touches and how often it has been
//! retried.

use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Feature,
    Bug,
    Refactor,
    Docs,
    Test,
    Deployment,
    Issue,
    Pr,
    Review,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Feature => "feature",
            TaskType::Bug => "bug",
            TaskType::Refactor => "refactor",
            TaskType::Docs => "docs",
            TaskType::Test => "test",
            TaskType::Deployment => "deployment",
            TaskType::Issue => "issue",
            TaskType::Pr => "pr",
            TaskType::Review => "review",
        };
        write!(f, "{}", s)
    }
}

/// Capability tag declared by workers and required by tasks.
///
/// Ordered so that a set of capabilities forms a stable signature for
/// grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Coordination,
    CodeGen,
    Review,
    Testing,
    Deployment,
    IssueTriage,
    Documentation,
    Refactoring,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 8] = [
        Capability::Coordination,
        Capability::CodeGen,
        Capability::Review,
        Capability::Testing,
        Capability::Deployment,
        Capability::IssueTriage,
        Capability::Documentation,
        Capability::Refactoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Coordination => "coordination",
            Capability::CodeGen => "codegen",
            Capability::Review => "review",
            Capability::Testing => "testing",
            Capability::Deployment => "deployment",
            Capability::IssueTriage => "issue_triage",
            Capability::Documentation => "documentation",
            Capability::Refactoring => "refactoring",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `pending -> claimed -> running -> completed | failed | timed_out`.
/// A failed or timed out task may be requeued back to `pending` by the
/// retry path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Reserved by a worker; file locks are held.
    Claimed,
    /// Being executed by the assigned worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Exceeded the worker timeout.
    TimedOut,
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Kind of work.
    pub task_type: TaskType,
    /// Lower values are more urgent.
    pub priority: u32,
    /// Tasks that must be completed before this one is eligible.
    pub dependencies: HashSet<TaskId>,
    /// Capabilities a worker should have to run this task.
    pub required_skills: BTreeSet<Capability>,
    /// Rough execution estimate in milliseconds.
    pub estimated_duration_ms: u64,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Worker holding the claim, if any.
    pub assigned_worker: Option<WorkerId>,
    /// Paths locked while the task is claimed or running.
    pub files_touched: BTreeSet<PathBuf>,
    /// Number of times the task has been requeued after a failure.
    pub retry_count: u32,
    /// Creation order, used as the FIFO tie-break.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with default priority and no requirements.
    pub fn new(title: &str, task_type: TaskType) -> Self {
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            task_type,
            priority: 5,
            dependencies: HashSet::new(),
            required_skills: BTreeSet::new(),
            estimated_duration_ms: 0,
            status: TaskStatus::Pending,
            assigned_worker: None,
            files_touched: BTreeSet::new(),
            retry_count: 0,
            sequence: next_sequence(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_skills(mut self, skills: impl IntoIterator<Item = Capability>) -> Self {
        self.required_skills.extend(skills);
        self
    }

    pub fn with_estimate_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn touching<P: Into<PathBuf>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        self.files_touched.extend(paths.into_iter().map(Into::into));
        self
    }

    pub(crate) fn claim(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Claimed;
        self.assigned_worker = Some(worker);
    }

    pub(crate) fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn time_out(&mut self) {
        self.status = TaskStatus::TimedOut;
        self.completed_at = Some(Utc::now());
    }

    /// Put a failed attempt back in line for another claim.
    pub(crate) fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.assigned_worker = None;
        self.retry_count += 1;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Check if the task holds a claim (claimed or running).
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, TaskStatus::Claimed | TaskStatus::Running)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Last error recorded on the task, if it failed.
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Ordering key: priority first, then creation order.
    pub fn order_key(&self) -> (u32, u64) {
        (self.priority, self.sequence)
    }
}
