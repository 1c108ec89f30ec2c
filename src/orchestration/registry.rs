//! Worker registry.
//!
//! The registry is the only mutator of a worker's `status` and
//! `current_load`. Iteration follows registration order so that selection
//! ties and round-robin dispatch are deterministic.

use crate::core::{Capability, TaskId, Worker, WorkerDescriptor, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Worker counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub offline: usize,
    pub total_load: u32,
    pub total_capacity: u32,
}

impl RegistryStatistics {
    /// Fraction of workers with at least one task.
    pub fn load_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.busy as f64 / self.total as f64
    }
}

/// Worker with the largest overlap with `required`.
///
/// Ties go to the lowest load, then the highest priority, then the
/// earliest in iteration order. With no required skills every worker
/// qualifies; otherwise at least one skill must overlap. Availability is
/// the caller's concern.
pub fn best_match<'a>(
    required: &BTreeSet<Capability>,
    workers: impl IntoIterator<Item = &'a Worker>,
) -> Option<&'a Worker> {
    let mut best: Option<(&'a Worker, usize)> = None;
    for worker in workers {
        let score = worker.skill_overlap(required);
        if !required.is_empty() && score == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((current, current_score)) => {
                (score, Reverse(worker.current_load), worker.priority)
                    > (current_score, Reverse(current.current_load), current.priority)
            }
        };
        if better {
            best = Some((worker, score));
        }
    }
    best.map(|(worker, _)| worker)
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
    order: Vec<WorkerId>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker with a fresh id, idle and unloaded.
    pub fn register(&mut self, descriptor: WorkerDescriptor) -> Worker {
        let worker = Worker::from_descriptor(descriptor);
        info!(worker = %worker.id.short(), name = %worker.name, "worker registered");
        self.order.push(worker.id);
        self.workers.insert(worker.id, worker.clone());
        worker
    }

    /// Remove a worker that has nothing assigned.
    pub fn unregister(&mut self, id: WorkerId) -> Result<Worker> {
        let worker = self.workers.get(&id).ok_or(Error::WorkerNotFound(id))?;
        if worker.current_load > 0 {
            return Err(Error::WorkerBusy {
                id,
                load: worker.current_load,
            });
        }
        self.order.retain(|w| *w != id);
        let worker = self.workers.remove(&id).ok_or(Error::WorkerNotFound(id))?;
        info!(worker = %id.short(), name = %worker.name, "worker unregistered");
        Ok(worker)
    }

    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers in registration order.
    pub fn workers(&self) -> Vec<&Worker> {
        self.order.iter().filter_map(|id| self.workers.get(id)).collect()
    }

    pub fn available_workers(&self) -> Vec<&Worker> {
        self.workers().into_iter().filter(|w| w.is_available()).collect()
    }

    /// Available worker with the largest skill overlap. See [`best_match`].
    pub fn find_best_worker(&self, required: &BTreeSet<Capability>) -> Option<&Worker> {
        best_match(required, self.available_workers())
    }

    /// Record `task` on `worker`. Returns false, changing nothing, when the
    /// worker is unknown, unhealthy or at capacity.
    pub fn assign_task(&mut self, worker: WorkerId, task: TaskId) -> bool {
        let Some(w) = self.workers.get_mut(&worker) else {
            return false;
        };
        if !w.is_available() {
            return false;
        }
        w.current_load += 1;
        w.active_tasks.insert(task);
        w.status = WorkerStatus::Busy;
        true
    }

    /// Undo an assignment. Idle again once the load reaches zero.
    pub fn release_task(&mut self, worker: WorkerId, task: TaskId) {
        let Some(w) = self.workers.get_mut(&worker) else {
            return;
        };
        if w.active_tasks.remove(&task) {
            w.current_load = w.current_load.saturating_sub(1);
        }
        if w.status == WorkerStatus::Busy && w.current_load == 0 {
            w.status = WorkerStatus::Idle;
        }
    }

    /// Take a worker out of selection until the tick after `tick`.
    pub fn mark_error(&mut self, worker: WorkerId, tick: u64) {
        if let Some(w) = self.workers.get_mut(&worker) {
            w.status = WorkerStatus::Error;
            w.error_tick = Some(tick);
            debug!(worker = %worker.short(), tick, "worker marked error");
        }
    }

    /// Return workers marked in an earlier tick to service.
    pub fn recover_errored(&mut self, tick: u64) -> Vec<WorkerId> {
        let mut recovered = Vec::new();
        for id in &self.order {
            let Some(w) = self.workers.get_mut(id) else {
                continue;
            };
            if w.status != WorkerStatus::Error || w.error_tick.is_some_and(|t| t >= tick) {
                continue;
            }
            w.status = if w.current_load > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
            w.error_tick = None;
            recovered.push(*id);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), tick, "workers recovered");
        }
        recovered
    }

    pub fn set_offline(&mut self, worker: WorkerId) {
        if let Some(w) = self.workers.get_mut(&worker) {
            w.status = WorkerStatus::Offline;
        }
    }

    pub fn record_outcome(&mut self, worker: WorkerId, success: bool) {
        if let Some(w) = self.workers.get_mut(&worker) {
            if success {
                w.tasks_completed += 1;
            } else {
                w.tasks_failed += 1;
            }
        }
    }

    /// Idle workers, most recently registered first.
    pub fn idle_workers_newest_first(&self) -> Vec<&Worker> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.workers.get(id))
            .filter(|w| w.is_idle())
            .collect()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            total: self.workers.len(),
            ..Default::default()
        };
        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Idle => stats.idle += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Error => stats.error += 1,
                WorkerStatus::Offline => stats.offline += 1,
            }
            stats.total_load += worker.current_load;
            stats.total_capacity += worker.max_concurrent_tasks;
        }
        stats
    }
}
