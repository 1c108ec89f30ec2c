//! Worker data model.
//!
//! A worker is one autonomous agent slot. It declares a set of
//! capabilities, a concurrency limit and a tie-break priority; the
//! registry tracks its load and health.

use crate::core::task::{Capability, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new unique worker identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health and availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    /// Recently failed; not selectable until the next health tick.
    Error,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What a work source supplies to register a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub name: String,
    pub skills: BTreeSet<Capability>,
    pub max_concurrent_tasks: u32,
    /// Higher wins ties during selection.
    #[serde(default)]
    pub priority: i32,
}

impl WorkerDescriptor {
    pub fn new(name: &str, skills: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            name: name.to_string(),
            skills: skills.into_iter().collect(),
            max_concurrent_tasks: 1,
            priority: 0,
        }
    }

    /// A worker that can do anything.
    pub fn generalist(name: &str) -> Self {
        Self::new(name, Capability::ALL)
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub skills: BTreeSet<Capability>,
    pub max_concurrent_tasks: u32,
    pub current_load: u32,
    pub status: WorkerStatus,
    pub priority: i32,
    /// Tasks currently assigned to this worker.
    pub active_tasks: HashSet<TaskId>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub registered_at: DateTime<Utc>,
    /// Health tick at which the worker entered `Error`.
    #[serde(skip)]
    pub(crate) error_tick: Option<u64>,
}

impl Worker {
    pub(crate) fn from_descriptor(descriptor: WorkerDescriptor) -> Self {
        Self {
            id: WorkerId::new(),
            name: descriptor.name,
            skills: descriptor.skills,
            max_concurrent_tasks: descriptor.max_concurrent_tasks.max(1),
            current_load: 0,
            status: WorkerStatus::Idle,
            priority: descriptor.priority,
            active_tasks: HashSet::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            registered_at: Utc::now(),
            error_tick: None,
        }
    }

    /// Healthy and below its concurrency limit.
    pub fn is_available(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
            && self.current_load < self.max_concurrent_tasks
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle && self.current_load == 0
    }

    /// Number of required capabilities this worker has.
    pub fn skill_overlap(&self, required: &BTreeSet<Capability>) -> usize {
        self.skills.intersection(required).count()
    }

    pub fn has_all_skills(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.skills)
    }
}
