//! Property tests for the core invariants.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use proptest::prelude::*;

use conductor::config::{Config, GroupingConfig, PoolConfig};
use conductor::core::{Capability, Task, TaskDAG, TaskId, WorkerId};
use conductor::orchestration::{LockManager, PoolManager, TaskGrouper};

use crate::fixtures::{hanging_backend, task};

const PATHS: [&str; 6] = ["a.rs", "b.rs", "src/c.rs", "src/d.rs", "docs/e.md", "f.toml"];

fn paths_strategy() -> impl Strategy<Value = Vec<PathBuf>> {
    proptest::collection::vec(0..PATHS.len(), 0..4)
        .prop_map(|idx| idx.into_iter().map(|i| PathBuf::from(PATHS[i])).collect())
}

// Task i may only depend on tasks 0..i, which keeps the graph acyclic.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = TaskDAG> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(0..3usize, n),
        )
            .prop_map(move |(raw_deps, signatures)| {
                let skills = [
                    vec![],
                    vec![Capability::Testing],
                    vec![Capability::CodeGen, Capability::Review],
                ];
                let mut tasks: Vec<Task> = Vec::with_capacity(n);
                for (i, deps) in raw_deps.into_iter().enumerate() {
                    let mut t = task(&format!("task-{}", i))
                        .with_skills(skills[signatures[i]].iter().copied());
                    if i > 0 {
                        for d in deps {
                            t = t.depends_on(tasks[d % i].id);
                        }
                    }
                    tasks.push(t);
                }
                TaskDAG::from_tasks(tasks).expect("acyclic by construction")
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Two tasks racing for paths: either the second gets everything or
    /// nothing, and no path ever has two holders.
    #[test]
    fn prop_lock_acquisition_is_atomic(first in paths_strategy(), second in paths_strategy()) {
        let locks = LockManager::new(Duration::from_secs(60));
        let (t1, t2) = (TaskId::new(), TaskId::new());
        let worker = WorkerId::new();

        prop_assert!(locks.acquire_locks(t1, worker, &first).is_acquired());
        let outcome = locks.acquire_locks(t2, worker, &second);

        let overlap: HashSet<&PathBuf> = first.iter().filter(|p| second.contains(p)).collect();
        if overlap.is_empty() {
            prop_assert!(outcome.is_acquired());
            let held: HashSet<PathBuf> = locks.locks_held_by(t2).into_iter().map(|l| l.resource_path).collect();
            let wanted: HashSet<PathBuf> = second.iter().cloned().collect();
            prop_assert_eq!(held, wanted);
        } else {
            prop_assert!(!outcome.is_acquired());
            prop_assert!(locks.locks_held_by(t2).is_empty());
            prop_assert!(outcome.conflicts().iter().all(|l| l.holder_task == t1));
        }

        let mut seen = HashSet::new();
        for lock in locks.active_locks() {
            prop_assert!(seen.insert(lock.resource_path.clone()));
        }
    }

    /// Backoff never shrinks with the retry count and never exceeds the cap.
    #[test]
    fn prop_backoff_is_monotonic(
        base in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        cap in 1u64..120_000,
    ) {
        let config = PoolConfig {
            retry_delay_ms: base,
            backoff_multiplier: multiplier,
            max_retry_delay_ms: cap,
            ..PoolConfig::default()
        };
        let mut previous = Duration::ZERO;
        for retry in 0..12 {
            let delay = config.retry_delay(retry);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= Duration::from_millis(cap));
            previous = delay;
        }
    }

    /// Every task lands in exactly one group; groups never span tiers or
    /// mix skill signatures, respect the size cap, and sit above the groups
    /// of their dependencies.
    #[test]
    fn prop_grouping_invariants(dag in dag_strategy(24), min in 1usize..4, extra in 0usize..5) {
        let config = GroupingConfig {
            min_group_size: min,
            max_group_size: min + extra,
            max_concurrent_groups: 3,
        };
        let grouper = TaskGrouper::new(config);
        let groups = grouper.group_tasks(&dag, Path::new("work")).unwrap();

        let mut level_of: HashMap<TaskId, usize> = HashMap::new();
        for group in &groups {
            prop_assert!(!group.is_empty());
            prop_assert!(group.len() <= min + extra);
            for t in &group.tasks {
                prop_assert_eq!(&t.required_skills, &group.required_skills);
                prop_assert!(level_of.insert(t.id, group.level).is_none());
            }
        }
        prop_assert_eq!(level_of.len(), dag.task_count());

        for t in dag.all_tasks() {
            for dep in &t.dependencies {
                prop_assert!(level_of[dep] < level_of[&t.id]);
            }
        }

        prop_assert!(grouper.validate_groups(&groups).is_valid());
        let concurrency = grouper.calculate_optimal_concurrency(&groups);
        prop_assert!(concurrency >= 1 && concurrency <= 3);
    }

    /// Whatever the load, the health check keeps the worker count within
    /// [min_workers, max_workers].
    #[test]
    fn prop_scaling_stays_in_bounds(min in 1usize..4, span in 0usize..5, jobs in 0usize..10) {
        let max = min + span;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let result: Result<(), TestCaseError> = runtime.block_on(async {
            let mut config = Config::default();
            config.pool.min_workers = min;
            config.pool.max_workers = max;
            let pool = PoolManager::new(config, hanging_backend()).unwrap();
            for i in 0..jobs {
                pool.submit_task(task(&format!("job-{}", i))).unwrap();
            }
            for _ in 0..6 {
                pool.tick();
                let total = pool.workers().len();
                prop_assert!(total >= min && total <= max, "{} workers outside [{}, {}]", total, min, max);
            }
            prop_assert_eq!(pool.snapshot().running_tasks, jobs.min(max));
            Ok(())
        });
        result?;
    }
}
