//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Pool configurations sized for fast, paused-clock tests
//! - Execution backends that record, fail on demand or hang
//! - Predefined task sets

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use conductor::config::Config;
use conductor::core::{Capability, Task, TaskType, Worker};
use conductor::orchestration::{ExecutionBackend, PoolEvent, PoolManager};
use conductor::Error;

/// A config whose health timer never fires on its own, so tests drive
/// `tick()` explicitly.
pub fn manual_config(min_workers: usize, max_workers: usize) -> Config {
    let mut config = Config::default();
    config.pool.min_workers = min_workers;
    config.pool.max_workers = max_workers;
    config.pool.health_check_interval_ms = 3_600_000;
    config.pool.shutdown_grace_ms = 100;
    config
}

/// One line per backend call, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Start(String),
    End(String),
}

/// Shared log of backend activity with paused-clock timestamps.
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<(Trace, Instant)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, trace: Trace) {
        self.entries.lock().push((trace, Instant::now()));
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.entries.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Start instants of every attempt of `title`.
    pub fn starts_of(&self, title: &str) -> Vec<Instant> {
        self.entries
            .lock()
            .iter()
            .filter(|(t, _)| *t == Trace::Start(title.to_string()))
            .map(|(_, at)| *at)
            .collect()
    }

    /// Position of a trace in the log. Panics if absent.
    pub fn position(&self, trace: Trace) -> usize {
        self.traces()
            .iter()
            .position(|t| *t == trace)
            .unwrap_or_else(|| panic!("{:?} not recorded", trace))
    }
}

/// Backend that sleeps `work` per task, recording start and end.
///
/// Titles listed in `failures` fail that many times before succeeding;
/// titles in `hangs` never finish for that many attempts.
#[derive(Clone)]
pub struct ScriptedBackend {
    pub recorder: Recorder,
    work: Duration,
    durations: Arc<HashMap<String, Duration>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    hangs: Arc<Mutex<HashMap<String, u32>>>,
}

impl ScriptedBackend {
    pub fn new(work: Duration) -> Self {
        Self {
            recorder: Recorder::new(),
            work,
            durations: Arc::new(HashMap::new()),
            failures: Arc::new(Mutex::new(HashMap::new())),
            hangs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the work time of one title.
    pub fn taking(mut self, title: &str, work: Duration) -> Self {
        Arc::make_mut(&mut self.durations).insert(title.to_string(), work);
        self
    }

    pub fn failing(self, title: &str, times: u32) -> Self {
        self.failures.lock().insert(title.to_string(), times);
        self
    }

    pub fn hanging(self, title: &str, times: u32) -> Self {
        self.hangs.lock().insert(title.to_string(), times);
        self
    }

    fn take(map: &Mutex<HashMap<String, u32>>, title: &str) -> bool {
        let mut map = map.lock();
        match map.get_mut(title) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn execute(
        &self,
        task: Task,
        _worker: Worker,
    ) -> futures::future::BoxFuture<'static, conductor::Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            this.recorder.push(Trace::Start(task.title.clone()));
            if Self::take(&this.hangs, &task.title) {
                futures::future::pending::<()>().await;
            }
            if Self::take(&this.failures, &task.title) {
                this.recorder.push(Trace::End(task.title.clone()));
                return Err(Error::Execution(format!("{} failed", task.title)));
            }
            let work = this.durations.get(&task.title).copied().unwrap_or(this.work);
            tokio::time::sleep(work).await;
            this.recorder.push(Trace::End(task.title.clone()));
            Ok(())
        })
    }
}

/// Backend whose attempts never finish.
pub fn hanging_backend() -> impl ExecutionBackend {
    |_task: Task, _worker: Worker| futures::future::pending::<conductor::Result<()>>()
}

/// Pool with an attached event channel.
pub fn pool_with_events(
    config: Config,
    backend: impl ExecutionBackend,
) -> (PoolManager, mpsc::Receiver<PoolEvent>) {
    let (tx, rx) = mpsc::channel(1024);
    let pool = PoolManager::new(config, backend)
        .expect("valid config")
        .with_events(tx);
    (pool, rx)
}

/// Drain every event currently buffered.
pub fn drain(rx: &mut mpsc::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn task(title: &str) -> Task {
    Task::new(title, TaskType::Feature)
}

pub fn skilled(title: &str, skills: &[Capability]) -> Task {
    task(title).with_skills(skills.iter().copied())
}

/// Three-task chain `schema -> api -> ui`.
pub fn chain() -> Vec<Task> {
    let schema = task("schema");
    let api = task("api").depends_on(schema.id);
    let ui = task("ui").depends_on(api.id);
    vec![ui, api, schema]
}
