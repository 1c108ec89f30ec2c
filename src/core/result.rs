//! Outcomes of task attempts and the final execution report.

use crate::core::task::TaskId;
use crate::core::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Record of one finished attempt. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Retries that preceded this attempt.
    pub retries: u32,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        status: ExecutionStatus,
        start_time: DateTime<Utc>,
        retries: u32,
        error: Option<String>,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            status,
            start_time,
            end_time: Utc::now(),
            retries,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }
}

/// A task that will never run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalFailure {
    pub task_id: TaskId,
    pub title: String,
    pub error: String,
    pub retries: u32,
}

/// Final report handed back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Every attempt, in the order it finished.
    pub attempts: Vec<ExecutionResult>,
    /// Tasks that failed permanently, including those failed because a
    /// dependency failed.
    pub failures: Vec<TerminalFailure>,
    pub completed: usize,
}

impl ExecutionReport {
    /// Last attempt of every task that reached success.
    pub fn successes(&self) -> Vec<&ExecutionResult> {
        self.attempts.iter().filter(|r| r.is_success()).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line per failure: title, retries and last error.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} completed, {} failed, {} attempts",
            self.completed,
            self.failures.len(),
            self.attempts.len()
        );
        for failure in &self.failures {
            out.push_str(&format!(
                "\n  {} [{}] after {} retries: {}",
                failure.title,
                failure.task_id.short(),
                failure.retries,
                failure.error
            ));
        }
        out
    }
}
