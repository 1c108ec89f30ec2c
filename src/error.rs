use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::{TaskId, WorkerId};
use crate::orchestration::GroupId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task {task_id} conflicts with locks on {}", display_paths(.paths))]
    Conflict { task_id: TaskId, paths: Vec<PathBuf> },

    #[error("Task {task_id} has unmet dependencies: {}", display_ids(.missing))]
    DependencyUnmet { task_id: TaskId, missing: Vec<TaskId> },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Worker {id} is busy with {load} task(s)")]
    WorkerBusy { id: WorkerId, load: u32 },

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Pool is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Failures that feed the retry path instead of surfacing to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Execution(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::short).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
