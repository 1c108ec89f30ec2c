//! Orchestration layer.
//!
//! Workers, task claiming with file locks, DAG grouping, tier scheduling and
//! the elastic pool that drives them.

mod backend;
mod grouper;
mod locks;
mod orchestrator;
mod pool;
mod registry;
mod scheduler;
mod strategy;

pub use backend::ExecutionBackend;
pub use grouper::{GroupId, GroupValidation, TaskGroup, TaskGrouper};
pub use locks::{normalize_path, FileLock, LockManager, LockOutcome, DEFAULT_LOCK_TTL};
pub use orchestrator::{OrchestratorStatistics, TaskOrchestrator};
pub use pool::{PoolEvent, PoolManager, PoolSnapshot};
pub use registry::{best_match, RegistryStatistics, WorkerRegistry};
pub use scheduler::{GroupProgress, GroupState, TaskScheduler};
pub use strategy::{select_worker, DistributionStrategy};
