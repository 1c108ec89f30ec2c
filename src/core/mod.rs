//! Core domain models for the conductor.
//!
//! Tasks, workers, execution outcomes and the dependency DAG. Everything
//! here is plain data plus pure graph logic; coordination lives in
//! [`crate::orchestration`].

pub mod dag;
pub mod result;
pub mod task;
pub mod worker;

pub use dag::TaskDAG;
pub use result::{ExecutionReport, ExecutionResult, ExecutionStatus, TerminalFailure};
pub use task::{Capability, Task, TaskId, TaskStatus, TaskType};
pub use worker::{Worker, WorkerDescriptor, WorkerId, WorkerStatus};
