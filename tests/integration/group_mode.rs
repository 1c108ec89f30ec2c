//! Group-mode integration tests.
//!
//! A whole DAG is submitted at once; the grouper batches each tier and the
//! scheduler releases groups tier by tier.

use std::path::Path;
use std::time::Duration;

use conductor::config::Config;
use conductor::core::{Capability, TaskDAG, TaskStatus};
use conductor::Error;

use crate::fixtures::{manual_config, pool_with_events, skilled, task, ScriptedBackend, Trace};

fn grouped_config(min_workers: usize) -> Config {
    let mut config = manual_config(min_workers, min_workers);
    config.grouping.min_group_size = 1;
    config.grouping.max_group_size = 2;
    config.pool.retry_delay_ms = 10;
    config
}

/// Test: Strict tier gating
/// Given tier 0 = {slow, fast} and `next` depending only on `fast`
/// When the DAG runs in group mode
/// Then `next` waits for the whole first tier, including `slow`
#[tokio::test(start_paused = true)]
async fn test_tiers_run_in_order() {
    let backend = ScriptedBackend::new(Duration::from_millis(10))
        .taking("slow", Duration::from_millis(200));
    let recorder = backend.recorder.clone();

    let slow = task("slow");
    let fast = task("fast");
    let next = task("next").depends_on(fast.id);
    let dag = TaskDAG::from_tasks(vec![slow, fast, next]).unwrap();

    let (pool, _events) = pool_with_events(grouped_config(2), backend);
    pool.start().unwrap();
    let groups = pool.submit_dag(dag, Path::new("/tmp/conductor")).unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].len(), 2);
    assert_eq!(groups[0].level, 0);
    assert_eq!(groups[1].level, 1);
    assert_eq!(groups[1].workspace, Path::new("/tmp/conductor").join(groups[1].id.as_str()));

    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);

    let next_start = recorder.position(Trace::Start("next".into()));
    assert!(recorder.position(Trace::End("slow".into())) < next_start);
    assert!(recorder.position(Trace::End("fast".into())) < next_start);

    let progress = pool.group_progress().unwrap();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.total, 2);
    assert_eq!(progress.percent_complete, 100.0);
    assert!(pool.progress_summary().unwrap().starts_with("Groups: 2/2 completed"));

    pool.shutdown().await;
}

/// Test: Skill signatures split a tier
/// Given a tier mixing testing and documentation tasks
/// When the DAG is grouped
/// Then each group holds a single signature
#[tokio::test(start_paused = true)]
async fn test_groups_never_mix_signatures() {
    let backend = ScriptedBackend::new(Duration::from_millis(5));
    let dag = TaskDAG::from_tasks(vec![
        skilled("unit", &[Capability::Testing]),
        skilled("guide", &[Capability::Documentation]),
        skilled("e2e", &[Capability::Testing]),
    ])
    .unwrap();

    let (pool, _events) = pool_with_events(grouped_config(2), backend);
    pool.start().unwrap();
    let groups = pool.submit_dag(dag, Path::new("work")).unwrap();

    let titles: Vec<Vec<String>> = groups
        .iter()
        .map(|g| g.tasks.iter().map(|t| t.title.clone()).collect())
        .collect();
    assert_eq!(titles, vec![vec!["unit", "e2e"], vec!["guide"]]);
    assert!(groups.iter().all(|g| g.level == 0));

    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);
    assert!(pool.report().all_succeeded());
}

/// Test: Failed group blocks later tiers
/// Given tier 0 = {bad, good}, `child` depending on `bad` and `sibling`
/// depending on `good`
/// When `bad` fails terminally
/// Then `child` fails as a dependent, `sibling` is blocked, and the pool
/// still reaches completion
#[tokio::test(start_paused = true)]
async fn test_failed_tier_blocks_later_groups() {
    let mut config = grouped_config(2);
    config.pool.max_retries = 0;
    let backend = ScriptedBackend::new(Duration::from_millis(10)).failing("bad", u32::MAX);
    let recorder = backend.recorder.clone();

    let bad = task("bad");
    let good = task("good");
    let child = task("child").depends_on(bad.id);
    let sibling = task("sibling").depends_on(good.id);
    let ids = [bad.id, good.id, child.id, sibling.id];
    let dag = TaskDAG::from_tasks(vec![bad, good, child, sibling]).unwrap();

    let (pool, _events) = pool_with_events(config, backend);
    pool.start().unwrap();
    pool.submit_dag(dag, Path::new("work")).unwrap();

    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);

    assert!(recorder.starts_of("child").is_empty());
    assert!(recorder.starts_of("sibling").is_empty());
    assert_eq!(pool.task(ids[1]).unwrap().status, TaskStatus::Completed);
    for id in [ids[0], ids[2], ids[3]] {
        assert!(matches!(pool.task(id).unwrap().status, TaskStatus::Failed { .. }));
    }

    let report = pool.report();
    assert_eq!(report.completed, 1);
    let mut failed: Vec<&str> = report.failures.iter().map(|f| f.title.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["bad", "child", "sibling"]);

    let progress = pool.group_progress().unwrap();
    assert_eq!(progress.failed, 2);
    assert_eq!(progress.completed, 0);

    pool.shutdown().await;
}

/// Test: One DAG at a time
/// Given a DAG still running
/// When a second DAG is submitted
/// Then it is rejected without touching the first
#[tokio::test(start_paused = true)]
async fn test_second_dag_rejected_while_running() {
    let backend = ScriptedBackend::new(Duration::from_millis(100));
    let (pool, _events) = pool_with_events(grouped_config(1), backend);
    pool.start().unwrap();

    let first = TaskDAG::from_tasks(vec![task("one")]).unwrap();
    pool.submit_dag(first, Path::new("work")).unwrap();

    let second = TaskDAG::from_tasks(vec![task("two")]).unwrap();
    let err = pool.submit_dag(second, Path::new("work")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(pool.orchestrator().tasks().len(), 1);

    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);
    let third = TaskDAG::from_tasks(vec![task("three")]).unwrap();
    assert!(pool.submit_dag(third, Path::new("work")).is_ok());
    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);
    assert_eq!(pool.report().completed, 2);

    pool.shutdown().await;
}

/// Test: Cycles from recorded dependencies are rejected
/// Given two tasks listing each other as dependencies, added one by one
/// When the DAG is submitted
/// Then it is rejected and nothing is queued
#[tokio::test(start_paused = true)]
async fn test_cyclic_dag_rejected_before_dispatch() {
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    let recorder = backend.recorder.clone();
    let (pool, _events) = pool_with_events(grouped_config(2), backend);
    pool.start().unwrap();

    let mut a = task("a");
    let mut b = task("b");
    a.dependencies.insert(b.id);
    b.dependencies.insert(a.id);
    let mut dag = TaskDAG::new();
    dag.add_task(a);
    dag.add_task(b);

    let err = pool.submit_dag(dag, Path::new("work")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(pool.orchestrator().tasks().is_empty());
    assert!(pool.group_progress().is_none());
    assert!(recorder.traces().is_empty());
    assert!(pool.wait_for_completion(Some(Duration::from_secs(1))).await);

    pool.shutdown().await;
}

/// Test: Hand-built DAGs tier by recorded dependencies
/// Given `child` listing `root` as a dependency, added before `root`
/// When the DAG is submitted
/// Then `child` lands on the tier after `root`
#[tokio::test(start_paused = true)]
async fn test_hand_built_dag_respects_dependencies() {
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    let recorder = backend.recorder.clone();
    let (pool, _events) = pool_with_events(grouped_config(2), backend);
    pool.start().unwrap();

    let root = task("root");
    let child = task("child").depends_on(root.id);
    let mut dag = TaskDAG::new();
    dag.add_task(child);
    dag.add_task(root);

    let groups = pool.submit_dag(dag, Path::new("work")).unwrap();
    let tiers: Vec<(usize, String)> = groups
        .iter()
        .map(|g| (g.level, g.tasks[0].title.clone()))
        .collect();
    assert_eq!(tiers, vec![(0, "root".to_string()), (1, "child".to_string())]);

    assert!(pool.wait_for_completion(Some(Duration::from_secs(5))).await);
    assert!(recorder.position(Trace::End("root".into())) < recorder.position(Trace::Start("child".into())));

    pool.shutdown().await;
}
