//! Auto-scaling integration tests.
//!
//! Ticks are driven by hand; attempts hang so load stays constant between
//! ticks.

use conductor::core::{Capability, WorkerDescriptor};
use conductor::orchestration::PoolEvent;

use crate::fixtures::{drain, hanging_backend, manual_config, pool_with_events, skilled, task};

fn scaled(events: Vec<PoolEvent>) -> Vec<(usize, usize)> {
    events
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::WorkersScaled { added, removed } => Some((added, removed)),
            _ => None,
        })
        .collect()
}

/// Test: Scale up under load
/// Given one worker and three hanging tasks
/// When the health check runs repeatedly
/// Then the pool grows by half its size per tick, never past max_workers
#[tokio::test(start_paused = true)]
async fn test_scale_up_capped_at_max() {
    let (pool, mut events) = pool_with_events(manual_config(1, 4), hanging_backend());
    pool.start().unwrap();
    for i in 0..3 {
        pool.submit_task(task(&format!("job-{}", i))).unwrap();
    }
    assert_eq!(pool.snapshot().running_tasks, 1);

    let mut sizes = Vec::new();
    for _ in 0..4 {
        pool.tick();
        sizes.push(pool.workers().len());
    }

    assert_eq!(sizes, vec![2, 3, 4, 4]);
    assert_eq!(pool.snapshot().running_tasks, 3);
    assert_eq!(pool.snapshot().idle_workers, 1);
    assert_eq!(scaled(drain(&mut events)), vec![(1, 0), (1, 0), (1, 0)]);

    pool.shutdown().await;
}

/// Test: Scale down when idle
/// Given six idle workers and min_workers = 1
/// When the health check runs repeatedly
/// Then idle workers are removed newest first, never below min_workers
#[tokio::test(start_paused = true)]
async fn test_scale_down_to_min() {
    let (pool, mut events) = pool_with_events(manual_config(1, 6), hanging_backend());
    pool.start().unwrap();
    let first = pool.workers()[0].id;
    for i in 0..5 {
        pool.add_worker(WorkerDescriptor::generalist(&format!("extra-{}", i)))
            .unwrap();
    }

    let mut sizes = Vec::new();
    for _ in 0..3 {
        pool.tick();
        sizes.push(pool.workers().len());
    }

    assert_eq!(sizes, vec![3, 1, 1]);
    assert_eq!(pool.workers()[0].id, first);
    assert_eq!(scaled(drain(&mut events)), vec![(0, 3), (0, 2)]);

    pool.shutdown().await;
}

/// Test: Scale-down keeps the last holder of a needed capability
/// Given an idle deployer and a queued deployment task waiting on a
/// dependency
/// When the pool scales down
/// Then the deployer survives while spare coders are removed
#[tokio::test(start_paused = true)]
async fn test_scale_down_keeps_unique_skill() {
    let (pool, _events) = pool_with_events(manual_config(1, 4), hanging_backend());
    let pool = pool.with_worker_template(WorkerDescriptor::new("coder", [Capability::CodeGen]));
    pool.start().unwrap();

    let build = task("build");
    let build_id = build.id;
    pool.submit_task(build).unwrap();
    for name in ["spare-a", "spare-b"] {
        pool.add_worker(WorkerDescriptor::new(name, [Capability::CodeGen]))
            .unwrap();
    }
    let deployer = pool
        .add_worker(WorkerDescriptor::new("deployer", [Capability::Deployment]))
        .unwrap();
    pool.submit_task(skilled("ship", &[Capability::Deployment]).depends_on(build_id))
        .unwrap();
    assert_eq!(pool.snapshot().queued_tasks, 1);

    pool.tick();

    let names: Vec<String> = pool.workers().into_iter().map(|w| w.name).collect();
    assert_eq!(names, vec!["coder-1", "deployer"]);
    assert!(pool.worker(deployer.id).is_some());

    pool.shutdown().await;
}

/// Test: Manual worker limits
/// Given a pool at max_workers
/// When another worker is added or a busy one removed
/// Then both calls are refused
#[tokio::test(start_paused = true)]
async fn test_manual_limits() {
    let (pool, _events) = pool_with_events(manual_config(1, 1), hanging_backend());
    pool.start().unwrap();
    let worker = pool.workers()[0].id;
    pool.submit_task(task("busy")).unwrap();

    assert!(pool.add_worker(WorkerDescriptor::generalist("extra")).is_err());
    assert!(pool.remove_worker(worker).is_err());
    assert_eq!(pool.workers().len(), 1);

    pool.shutdown().await;
}

/// Test: Scale up at exactly the threshold
/// Given five workers with four busy (load 0.8, the default threshold)
/// When the health check runs
/// Then the pool grows
#[tokio::test(start_paused = true)]
async fn test_scale_up_at_threshold() {
    let (pool, mut events) = pool_with_events(manual_config(5, 10), hanging_backend());
    pool.start().unwrap();
    for i in 0..4 {
        pool.submit_task(task(&format!("job-{}", i))).unwrap();
    }
    let snapshot = pool.snapshot();
    assert_eq!((snapshot.total_workers, snapshot.active_workers), (5, 4));

    pool.tick();

    assert_eq!(pool.workers().len(), 8);
    assert_eq!(scaled(drain(&mut events)), vec![(3, 0)]);

    pool.shutdown().await;
}

/// Test: Scale down at exactly the threshold
/// Given two workers with one busy and scale_down_threshold = 0.5
/// When the health check runs
/// Then the idle worker is removed
#[tokio::test(start_paused = true)]
async fn test_scale_down_at_threshold() {
    let mut config = manual_config(1, 4);
    config.pool.scale_down_threshold = 0.5;
    let (pool, mut events) = pool_with_events(config, hanging_backend());
    pool.start().unwrap();
    pool.submit_task(task("busy")).unwrap();
    pool.add_worker(WorkerDescriptor::generalist("spare")).unwrap();
    assert_eq!(pool.snapshot().active_workers, 1);

    pool.tick();

    let names: Vec<String> = pool.workers().into_iter().map(|w| w.name).collect();
    assert_eq!(names.len(), 1);
    assert_ne!(names[0], "spare");
    assert_eq!(pool.snapshot().running_tasks, 1);
    assert_eq!(scaled(drain(&mut events)), vec![(0, 1)]);

    pool.shutdown().await;
}
