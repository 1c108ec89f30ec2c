//! Worker selection strategies.
//!
//! Dispatch is a pure function of the task, the worker list and a
//! round-robin cursor. Only available workers are ever selected.

use crate::core::{Task, Worker, WorkerId};
use crate::orchestration::registry::best_match;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Next available worker after the previous pick.
    RoundRobin,
    /// Available worker with the fewest tasks.
    LeastLoaded,
    /// Least loaded worker having every required skill, falling back to
    /// least loaded overall.
    #[default]
    SkillBased,
    /// Available worker with the highest priority.
    PriorityBased,
    /// Largest skill overlap, as the registry ranks it.
    BestMatch,
}

impl std::fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DistributionStrategy::RoundRobin => "round_robin",
            DistributionStrategy::LeastLoaded => "least_loaded",
            DistributionStrategy::SkillBased => "skill_based",
            DistributionStrategy::PriorityBased => "priority_based",
            DistributionStrategy::BestMatch => "best_match",
        };
        write!(f, "{}", s)
    }
}

fn least_loaded<'a>(workers: impl Iterator<Item = &'a Worker>) -> Option<&'a Worker> {
    // min_by_key keeps the first of equal keys.
    workers.min_by_key(|w| w.current_load)
}

/// Pick a worker for `task` from `workers` (registration order).
///
/// `cursor` is the round-robin position and is only advanced by
/// [`DistributionStrategy::RoundRobin`].
pub fn select_worker(
    strategy: DistributionStrategy,
    task: &Task,
    workers: &[&Worker],
    cursor: &mut usize,
) -> Option<WorkerId> {
    let available = || workers.iter().copied().filter(|w| w.is_available());

    let chosen = match strategy {
        DistributionStrategy::RoundRobin => {
            let n = workers.len();
            (0..n)
                .map(|offset| (*cursor + offset) % n)
                .find(|&i| workers[i].is_available())
                .map(|i| {
                    *cursor = i + 1;
                    workers[i]
                })
        }
        DistributionStrategy::LeastLoaded => least_loaded(available()),
        DistributionStrategy::SkillBased => {
            least_loaded(available().filter(|w| w.has_all_skills(&task.required_skills)))
                .or_else(|| least_loaded(available()))
        }
        DistributionStrategy::PriorityBased => {
            // max_by_key keeps the last of equal keys, so compare explicitly.
            available().fold(None, |best: Option<&Worker>, w| match best {
                Some(b) if (b.priority, std::cmp::Reverse(b.current_load))
                    >= (w.priority, std::cmp::Reverse(w.current_load)) =>
                {
                    Some(b)
                }
                _ => Some(w),
            })
        }
        DistributionStrategy::BestMatch => best_match(&task.required_skills, available()),
    };
    chosen.map(|w| w.id)
}
