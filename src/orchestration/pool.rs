//! Worker pool manager.
//!
//! The `PoolManager` owns the worker registry and the task queue, hands
//! claimed tasks to an [`ExecutionBackend`] and supervises every attempt:
//! failures are retried with exponential backoff, attempts that outlive the
//! worker timeout are force-failed on the health tick, and the worker count
//! is scaled between the configured bounds.
//!
//! Tasks arrive either one by one (`submit_task`, `submit_tasks`) or as a
//! whole DAG (`submit_dag`), in which case the grouper and the tier
//! scheduler decide when each group's tasks are released into the queue.
//!
//! All mutable state sits behind one `parking_lot` mutex that is never held
//! across an `.await`. Lock order is pool state, then orchestrator task
//! table, then lock table.

use crate::config::Config;
use crate::core::{
    Capability, ExecutionReport, ExecutionResult, ExecutionStatus, Task, TaskDAG, TaskId,
    TaskStatus, TerminalFailure, Worker, WorkerDescriptor, WorkerId,
};
use crate::error::{Error, Result};
use crate::orchestration::backend::ExecutionBackend;
use crate::orchestration::grouper::{GroupId, TaskGroup, TaskGrouper};
use crate::orchestration::locks::LockManager;
use crate::orchestration::orchestrator::TaskOrchestrator;
use crate::orchestration::registry::WorkerRegistry;
use crate::orchestration::scheduler::{GroupProgress, TaskScheduler};
use crate::orchestration::strategy::select_worker;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serializable progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub avg_task_duration_ms: f64,
    /// Completed tasks per second since the pool was created.
    pub throughput: f64,
}

/// Events emitted by the pool for lifecycle changes.
///
/// Delivery is best effort: a full channel drops the event.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
        /// Retries that preceded this attempt.
        retries: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        duration: Duration,
    },
    /// A failed attempt was requeued.
    TaskRetrying {
        task_id: TaskId,
        retry: u32,
        delay: Duration,
    },
    /// The task will not run again.
    TaskFailed {
        task_id: TaskId,
        error: String,
        retries: u32,
    },
    WorkersScaled { added: usize, removed: usize },
    Progress(PoolSnapshot),
}

#[derive(Debug, Clone, Copy)]
struct QueuedTask {
    task_id: TaskId,
    key: (u32, u64),
    retry: bool,
    not_before: Option<Instant>,
}

struct RunningTask {
    worker: WorkerId,
    attempt: u64,
    retries: u32,
    started: Instant,
    start_time: DateTime<Utc>,
    abort: AbortHandle,
}

/// Group-mode bookkeeping for one submitted DAG.
struct GroupRun {
    scheduler: TaskScheduler,
    group_of: HashMap<TaskId, GroupId>,
    remaining: HashMap<GroupId, usize>,
    failed: HashSet<GroupId>,
}

struct PoolState {
    registry: WorkerRegistry,
    queue: VecDeque<QueuedTask>,
    running: HashMap<TaskId, RunningTask>,
    attempts: Vec<ExecutionResult>,
    failures: Vec<TerminalFailure>,
    completed: usize,
    total_duration: Duration,
    tick: u64,
    cursor: usize,
    next_attempt: u64,
    spawned: usize,
    template: WorkerDescriptor,
    groups: Option<GroupRun>,
    events: Option<mpsc::Sender<PoolEvent>>,
    shutting_down: bool,
}

impl PoolState {
    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    /// New work goes behind retries and behind anything at least as urgent.
    fn enqueue(&mut self, task_id: TaskId, key: (u32, u64)) {
        let position = self
            .queue
            .iter()
            .position(|q| !q.retry && q.key > key)
            .unwrap_or(self.queue.len());
        self.queue.insert(
            position,
            QueuedTask {
                task_id,
                key,
                retry: false,
                not_before: None,
            },
        );
    }

    fn spawn_worker(&mut self) -> Worker {
        self.spawned += 1;
        let mut descriptor = self.template.clone();
        descriptor.name = format!("{}-{}", self.template.name, self.spawned);
        self.registry.register(descriptor)
    }

    fn is_finished(&self) -> bool {
        self.queue.is_empty()
            && self.running.is_empty()
            && self
                .groups
                .as_ref()
                .map_or(true, |g| !g.scheduler.has_work_remaining())
    }
}

struct Shared {
    config: Config,
    orchestrator: TaskOrchestrator,
    backend: Arc<dyn ExecutionBackend>,
    state: Mutex<PoolState>,
    cancel: CancellationToken,
    health: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
    created: Instant,
}

/// Elastic worker pool. Cheap to clone; clones share one pool.
///
/// # Example
///
/// ```ignore
/// use conductor::config::Config;
/// use conductor::core::{Task, TaskType};
/// use conductor::orchestration::PoolManager;
///
/// let pool = PoolManager::new(Config::default(), |task, worker| async move {
///     run_agent(&task, &worker).await
/// })?;
/// pool.start()?;
/// pool.submit_task(Task::new("fix login", TaskType::Bug))?;
/// pool.wait_for_completion(None).await;
/// let report = pool.report();
/// pool.shutdown().await;
/// ```
#[derive(Clone)]
pub struct PoolManager {
    shared: Arc<Shared>,
}

impl PoolManager {
    /// Create a pool with no workers. Call [`PoolManager::start`] to bring it
    /// up to `min_workers` and begin health checks.
    pub fn new(config: Config, backend: impl ExecutionBackend) -> Result<Self> {
        config.validate()?;
        let locks = Arc::new(LockManager::new(config.locks.lock_ttl()));
        let state = PoolState {
            registry: WorkerRegistry::new(),
            queue: VecDeque::new(),
            running: HashMap::new(),
            attempts: Vec::new(),
            failures: Vec::new(),
            completed: 0,
            total_duration: Duration::ZERO,
            tick: 0,
            cursor: 0,
            next_attempt: 0,
            spawned: 0,
            template: WorkerDescriptor::generalist("worker"),
            groups: None,
            events: None,
            shutting_down: false,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                orchestrator: TaskOrchestrator::new(locks),
                backend: Arc::new(backend),
                state: Mutex::new(state),
                cancel: CancellationToken::new(),
                health: Mutex::new(None),
                wake: Notify::new(),
                created: Instant::now(),
            }),
        })
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(self, tx: mpsc::Sender<PoolEvent>) -> Self {
        self.shared.state.lock().events = Some(tx);
        self
    }

    /// Descriptor used for workers added by `start` and auto-scaling.
    pub fn with_worker_template(self, template: WorkerDescriptor) -> Self {
        self.shared.state.lock().template = template;
        self
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.shared.orchestrator
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.shared.orchestrator.get_task(id)
    }

    /// Workers in registration order.
    pub fn workers(&self) -> Vec<Worker> {
        self.shared
            .state
            .lock()
            .registry
            .workers()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn worker(&self, id: WorkerId) -> Option<Worker> {
        self.shared.state.lock().registry.get(id).cloned()
    }

    pub fn add_worker(&self, descriptor: WorkerDescriptor) -> Result<Worker> {
        let worker = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            let max = self.shared.config.pool.max_workers;
            if state.registry.len() >= max {
                return Err(Error::PoolFull { max });
            }
            state.registry.register(descriptor)
        };
        self.dispatch();
        Ok(worker)
    }

    /// Remove an idle worker. Busy workers are refused.
    pub fn remove_worker(&self, id: WorkerId) -> Result<Worker> {
        self.shared.state.lock().registry.unregister(id)
    }

    /// Bring the pool up to `min_workers` and start the health-check timer.
    pub fn start(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let workers = {
            let mut state = self.shared.state.lock();
            while state.registry.len() < self.shared.config.pool.min_workers {
                state.spawn_worker();
            }
            state.registry.len()
        };
        {
            let mut health = self.shared.health.lock();
            if health.is_none() {
                *health = Some(self.spawn_health_loop());
            }
        }
        info!(workers, strategy = %self.shared.config.pool.strategy, "pool started");
        self.dispatch();
        Ok(())
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        let period = self.shared.config.pool.health_check_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("health loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        PoolManager { shared }.tick();
                    }
                }
            }
        })
    }

    /// Queue one task. Its dependencies must already be known to the pool.
    pub fn submit_task(&self, task: Task) -> Result<TaskId> {
        let id = task.id;
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            let orchestrator = &self.shared.orchestrator;
            if let Some(dep) = task.dependencies.iter().find(|d| !orchestrator.contains(**d)) {
                return Err(Error::Validation(format!(
                    "Task '{}' depends on unknown task {}",
                    task.title, dep
                )));
            }
            let key = task.order_key();
            orchestrator.add_task(task)?;
            state.enqueue(id, key);
        }
        self.dispatch();
        Ok(id)
    }

    /// Queue a batch after checking it forms a DAG.
    ///
    /// Dependencies may point inside the batch or at earlier submissions.
    /// Nothing is queued when validation fails. Returns the ids in
    /// topological order.
    pub fn submit_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        let orchestrator = &self.shared.orchestrator;
        let batch: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        if batch.len() != tasks.len() {
            return Err(Error::Validation("duplicate task ids in batch".to_string()));
        }
        for task in &tasks {
            if orchestrator.contains(task.id) {
                return Err(Error::Validation(format!(
                    "Task {} already exists",
                    task.id
                )));
            }
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| !batch.contains(*d) && !orchestrator.contains(**d))
            {
                return Err(Error::Validation(format!(
                    "Task '{}' depends on unknown task {}",
                    task.title, dep
                )));
            }
        }

        let local = tasks.iter().cloned().map(|mut t| {
            t.dependencies.retain(|d| batch.contains(d));
            t
        });
        let dag = TaskDAG::from_tasks(local)?;
        let order: Vec<TaskId> = dag.topological_order()?.iter().map(|t| t.id).collect();
        let mut by_id: HashMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();

        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            for id in &order {
                if let Some(task) = by_id.remove(id) {
                    let key = task.order_key();
                    orchestrator.add_task(task)?;
                    state.enqueue(*id, key);
                }
            }
        }
        debug!(tasks = order.len(), "task batch submitted");
        self.dispatch();
        Ok(order)
    }

    /// Run a whole DAG in group mode.
    ///
    /// The graph is grouped and validated before anything is queued;
    /// groups are then released tier by tier, at most
    /// `calculate_optimal_concurrency` at a time.
    pub fn submit_dag(&self, dag: TaskDAG, base_path: &Path) -> Result<Vec<TaskGroup>> {
        let orchestrator = &self.shared.orchestrator;
        dag.validate()?;
        let grouper = TaskGrouper::new(self.shared.config.grouping.clone());
        let groups = grouper.group_tasks(&dag, base_path)?;
        for warning in grouper.validate_groups(&groups).into_result()? {
            debug!(%warning, "group validation");
        }

        for task in dag.all_tasks() {
            if orchestrator.contains(task.id) {
                return Err(Error::Validation(format!(
                    "Task {} already exists",
                    task.id
                )));
            }
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| !dag.contains_task(d) && !orchestrator.contains(**d))
            {
                return Err(Error::Validation(format!(
                    "Task '{}' depends on unknown task {}",
                    task.title, dep
                )));
            }
        }

        let concurrency = grouper.calculate_optimal_concurrency(&groups);
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            if state
                .groups
                .as_ref()
                .is_some_and(|g| g.scheduler.has_work_remaining())
            {
                return Err(Error::Validation(
                    "a task graph is already being scheduled".to_string(),
                ));
            }
            for task in dag.into_tasks() {
                orchestrator.add_task(task)?;
            }
            let group_of = groups
                .iter()
                .flat_map(|g| g.tasks.iter().map(move |t| (t.id, g.id.clone())))
                .collect();
            let remaining = groups.iter().map(|g| (g.id.clone(), g.len())).collect();
            state.groups = Some(GroupRun {
                scheduler: TaskScheduler::new(groups.clone(), concurrency),
                group_of,
                remaining,
                failed: HashSet::new(),
            });
        }
        info!(groups = groups.len(), concurrency, "task graph submitted");
        self.dispatch();
        Ok(groups)
    }

    /// Start as many queued tasks as workers and locks allow.
    fn dispatch(&self) {
        {
            let mut guard = self.shared.state.lock();
            if !guard.shutting_down {
                self.dispatch_locked(&mut guard);
            }
        }
        self.shared.wake.notify_waiters();
    }

    fn dispatch_locked(&self, state: &mut PoolState) {
        self.release_groups(state);

        let orchestrator = &self.shared.orchestrator;
        let strategy = self.shared.config.pool.strategy;
        let now = Instant::now();
        let mut i = 0;
        while i < state.queue.len() {
            if state.registry.available_workers().is_empty() {
                break;
            }
            let entry = state.queue[i];
            if entry.not_before.is_some_and(|t| t > now) {
                i += 1;
                continue;
            }
            let Some(task) = orchestrator.get_task(entry.task_id) else {
                state.queue.remove(i);
                continue;
            };
            if task.status != TaskStatus::Pending {
                state.queue.remove(i);
                continue;
            }
            if !orchestrator
                .missing_dependencies(task.id)
                .is_ok_and(|missing| missing.is_empty())
            {
                i += 1;
                continue;
            }

            let workers = state.registry.workers();
            let Some(worker_id) = select_worker(strategy, &task, &workers, &mut state.cursor)
            else {
                i += 1;
                continue;
            };

            match orchestrator.claim_task(worker_id, task.id) {
                Ok(claimed) => {
                    state.queue.remove(i);
                    if !self.launch(state, claimed, worker_id) {
                        state.queue.insert(i, entry);
                        i += 1;
                    }
                }
                Err(err) if err.is_conflict() => {
                    debug!(task = %task.id.short(), %err, "claim deferred");
                    i += 1;
                }
                Err(Error::DependencyUnmet { .. }) => i += 1,
                Err(err) => {
                    warn!(task = %task.id.short(), %err, "dropping unclaimable task");
                    state.queue.remove(i);
                }
            }
        }
    }

    /// Assign and spawn one claimed task. Returns false, with the claim
    /// undone, if the worker refused it.
    fn launch(&self, state: &mut PoolState, task: Task, worker_id: WorkerId) -> bool {
        let orchestrator = &self.shared.orchestrator;
        let task_id = task.id;
        if !state.registry.assign_task(worker_id, task_id) {
            if let Err(err) = orchestrator.unclaim_task(task_id) {
                warn!(task = %task_id.short(), %err, "failed to undo claim");
            }
            return false;
        }
        if let Err(err) = orchestrator.start_task(task_id) {
            warn!(task = %task_id.short(), %err, "failed to mark task running");
        }
        let Some(worker) = state.registry.get(worker_id).cloned() else {
            return false;
        };

        state.next_attempt += 1;
        let attempt = state.next_attempt;
        let retries = task.retry_count;
        info!(
            task = %task_id.short(),
            title = %task.title,
            worker = %worker.name,
            retries,
            "task started"
        );
        state.emit(PoolEvent::TaskStarted {
            task_id,
            worker_id,
            retries,
        });

        let pool = self.clone();
        let execution = self.shared.backend.execute(task, worker);
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(execution)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Execution("execution panicked".to_string())));
            pool.finish(task_id, attempt, outcome);
        });

        state.running.insert(
            task_id,
            RunningTask {
                worker: worker_id,
                attempt,
                retries,
                started: Instant::now(),
                start_time: Utc::now(),
                abort: handle.abort_handle(),
            },
        );
        true
    }

    /// Record the outcome of an attempt. Outcomes of attempts that were
    /// already timed out are ignored.
    fn finish(&self, task_id: TaskId, attempt: u64, outcome: Result<()>) {
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if !state
                .running
                .get(&task_id)
                .is_some_and(|r| r.attempt == attempt)
            {
                debug!(task = %task_id.short(), attempt, "stale completion ignored");
                return;
            }
            let Some(run) = state.running.remove(&task_id) else {
                return;
            };
            let orchestrator = &self.shared.orchestrator;

            match outcome {
                Ok(()) => {
                    if let Err(err) = orchestrator.complete_task(task_id, true) {
                        warn!(task = %task_id.short(), %err, "completion not recorded");
                    }
                    state.registry.release_task(run.worker, task_id);
                    state.registry.record_outcome(run.worker, true);
                    state.attempts.push(ExecutionResult::new(
                        task_id,
                        run.worker,
                        ExecutionStatus::Success,
                        run.start_time,
                        run.retries,
                        None,
                    ));
                    let duration = run.started.elapsed();
                    state.completed += 1;
                    state.total_duration += duration;
                    state.emit(PoolEvent::TaskCompleted {
                        task_id,
                        worker_id: run.worker,
                        duration,
                    });
                    self.settle_group_task(state, task_id, true);
                }
                Err(err) => {
                    let message = err.to_string();
                    if let Err(err) = orchestrator.fail_task(task_id, &message) {
                        warn!(task = %task_id.short(), %err, "failure not recorded");
                    }
                    state.registry.release_task(run.worker, task_id);
                    state.registry.record_outcome(run.worker, false);
                    state.attempts.push(ExecutionResult::new(
                        task_id,
                        run.worker,
                        ExecutionStatus::Failed,
                        run.start_time,
                        run.retries,
                        Some(message.clone()),
                    ));
                    debug!(task = %task_id.short(), error = %message, "attempt failed");
                    self.retry_or_fail(state, task_id, &message);
                }
            }
        }
        self.dispatch();
    }

    /// Requeue a failed attempt with backoff, or fail it for good once
    /// `max_retries` is spent.
    fn retry_or_fail(&self, state: &mut PoolState, task_id: TaskId, error: &str) {
        let orchestrator = &self.shared.orchestrator;
        let Some(task) = orchestrator.get_task(task_id) else {
            return;
        };
        let pool_config = &self.shared.config.pool;
        if state.shutting_down || task.retry_count >= pool_config.max_retries {
            self.fail_permanently(state, &task, error);
            return;
        }

        let delay = pool_config.retry_delay(task.retry_count);
        let requeued = match orchestrator.requeue_task(task_id) {
            Ok(requeued) => requeued,
            Err(err) => {
                warn!(task = %task_id.short(), %err, "requeue refused");
                self.fail_permanently(state, &task, error);
                return;
            }
        };
        state.queue.push_front(QueuedTask {
            task_id,
            key: requeued.order_key(),
            retry: true,
            not_before: Some(Instant::now() + delay),
        });
        info!(
            task = %task_id.short(),
            retry = requeued.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        state.emit(PoolEvent::TaskRetrying {
            task_id,
            retry: requeued.retry_count,
            delay,
        });
        self.dispatch_after(delay);
    }

    fn dispatch_after(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(shared) = weak.upgrade() {
                        PoolManager { shared }.dispatch();
                    }
                }
            }
        });
    }

    /// Terminal failure, cascaded to every task that depends on it.
    fn fail_permanently(&self, state: &mut PoolState, task: &Task, error: &str) {
        self.record_terminal(state, task, error);
        warn!(
            task = %task.id.short(),
            title = %task.title,
            retries = task.retry_count,
            error,
            "task failed permanently"
        );
        self.settle_group_task(state, task.id, false);

        let orchestrator = &self.shared.orchestrator;
        let reason = format!("dependency '{}' failed", task.title);
        for dependent in orchestrator.transitive_dependents(task.id) {
            let Some(dependent) = orchestrator.get_task(dependent) else {
                continue;
            };
            if dependent.status != TaskStatus::Pending {
                continue;
            }
            self.record_terminal(state, &dependent, &reason);
            self.settle_group_task(state, dependent.id, false);
        }
    }

    fn record_terminal(&self, state: &mut PoolState, task: &Task, error: &str) {
        if let Err(err) = self.shared.orchestrator.fail_terminal(task.id, error) {
            warn!(task = %task.id.short(), %err, "terminal failure not recorded");
        }
        state.queue.retain(|q| q.task_id != task.id);
        state.failures.push(TerminalFailure {
            task_id: task.id,
            title: task.title.clone(),
            error: error.to_string(),
            retries: task.retry_count,
        });
        state.emit(PoolEvent::TaskFailed {
            task_id: task.id,
            error: error.to_string(),
            retries: task.retry_count,
        });
    }

    /// Count a task's terminal outcome against its group.
    fn settle_group_task(&self, state: &mut PoolState, task_id: TaskId, success: bool) {
        let Some(run) = state.groups.as_mut() else {
            return;
        };
        let Some(group) = run.group_of.get(&task_id).cloned() else {
            return;
        };
        if !success {
            run.failed.insert(group.clone());
        }
        let Some(remaining) = run.remaining.get_mut(&group) else {
            return;
        };
        if *remaining == 0 {
            return;
        }
        *remaining -= 1;
        if *remaining > 0 {
            return;
        }

        let result = if run.failed.contains(&group) {
            run.scheduler.fail_group(&group, "one or more tasks failed")
        } else {
            run.scheduler.complete_group(&group)
        };
        match result {
            Ok(()) => info!(%group, summary = %run.scheduler.generate_progress_summary(), "group finished"),
            Err(err) => debug!(%group, %err, "group state unchanged"),
        }
    }

    /// Group mode: fail groups stuck behind a failed tier and release the
    /// tasks of every group the scheduler lets start.
    fn release_groups(&self, state: &mut PoolState) {
        let Some(run) = state.groups.as_mut() else {
            return;
        };

        let mut blocked_tasks = Vec::new();
        let blocked: Vec<(GroupId, Vec<TaskId>)> = run
            .scheduler
            .blocked_groups()
            .iter()
            .map(|g| (g.id.clone(), g.task_ids()))
            .collect();
        for (group, tasks) in blocked {
            warn!(%group, "group blocked by a failed tier");
            if let Err(err) = run.scheduler.fail_group(&group, "an earlier tier failed") {
                debug!(%group, %err, "blocked group not failed");
            }
            blocked_tasks.extend(tasks);
        }

        let mut released = Vec::new();
        while run.scheduler.can_accept_work() {
            let Some(next) = run.scheduler.get_next_group() else {
                break;
            };
            let group = next.id.clone();
            let tasks: Vec<(TaskId, (u32, u64))> =
                next.tasks.iter().map(|t| (t.id, t.order_key())).collect();
            if let Err(err) = run.scheduler.start_group(&group) {
                warn!(%group, %err, "group not started");
                break;
            }
            info!(%group, tasks = tasks.len(), "group started");
            released.extend(tasks);
        }

        let orchestrator = &self.shared.orchestrator;
        for id in blocked_tasks {
            if let Some(task) = orchestrator.get_task(id) {
                if task.status == TaskStatus::Pending {
                    self.record_terminal(state, &task, "blocked by a failed group in an earlier tier");
                }
            }
        }
        for (id, key) in released {
            state.enqueue(id, key);
        }
    }

    /// One health-check pass.
    ///
    /// Recovers workers marked in an earlier tick, renews the locks of
    /// running tasks, sweeps expired locks, force-fails attempts running
    /// longer than the worker timeout, auto-scales and dispatches.
    pub fn tick(&self) {
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            state.tick += 1;
            let tick = state.tick;
            state.registry.recover_errored(tick);

            let orchestrator = &self.shared.orchestrator;
            for id in state.running.keys() {
                orchestrator.heartbeat(*id);
            }
            orchestrator.cleanup_expired_locks();

            let timeout = self.shared.config.pool.worker_timeout();
            let expired: Vec<TaskId> = state
                .running
                .iter()
                .filter(|(_, run)| run.started.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            for task_id in expired {
                let Some(run) = state.running.remove(&task_id) else {
                    continue;
                };
                run.abort.abort();
                if let Err(err) = orchestrator.time_out_task(task_id, timeout) {
                    warn!(task = %task_id.short(), %err, "timeout not recorded");
                }
                state.registry.release_task(run.worker, task_id);
                state.registry.record_outcome(run.worker, false);
                state.registry.mark_error(run.worker, tick);
                let message = Error::Timeout(timeout).to_string();
                state.attempts.push(ExecutionResult::new(
                    task_id,
                    run.worker,
                    ExecutionStatus::Timeout,
                    run.start_time,
                    run.retries,
                    Some(message.clone()),
                ));
                self.retry_or_fail(state, task_id, &message);
            }

            self.autoscale(state);
        }
        self.dispatch();
        let snapshot = self.snapshot();
        self.shared.state.lock().emit(PoolEvent::Progress(snapshot));
    }

    fn autoscale(&self, state: &mut PoolState) {
        let config = &self.shared.config.pool;
        let stats = state.registry.statistics();
        let mut added = 0;
        let mut removed = 0;

        if stats.total > 0 {
            let ratio = stats.load_ratio();
            if ratio >= config.scale_up_threshold && stats.total < config.max_workers {
                let step = (stats.total as f64 * 0.5).ceil() as usize;
                for _ in 0..step.max(1).min(config.max_workers - stats.total) {
                    state.spawn_worker();
                    added += 1;
                }
            } else if ratio <= config.scale_down_threshold && stats.total > config.min_workers {
                let step = (stats.idle as f64 * 0.5).ceil() as usize;
                removed = self.scale_down(state, step.min(stats.total - config.min_workers));
            }
        }
        while state.registry.len() < config.min_workers {
            state.spawn_worker();
            added += 1;
        }

        if added > 0 || removed > 0 {
            info!(added, removed, workers = state.registry.len(), "workers scaled");
            state.emit(PoolEvent::WorkersScaled { added, removed });
        }
    }

    /// Remove up to `budget` idle workers, newest first, keeping any worker
    /// that is the last holder of a capability queued work requires.
    fn scale_down(&self, state: &mut PoolState, budget: usize) -> usize {
        let orchestrator = &self.shared.orchestrator;
        let needed: BTreeSet<Capability> = state
            .queue
            .iter()
            .filter_map(|q| orchestrator.get_task(q.task_id))
            .flat_map(|t| t.required_skills)
            .collect();
        let candidates: Vec<WorkerId> = state
            .registry
            .idle_workers_newest_first()
            .iter()
            .map(|w| w.id)
            .collect();

        let mut removed = 0;
        for id in candidates {
            if removed >= budget {
                break;
            }
            let Some(worker) = state.registry.get(id) else {
                continue;
            };
            let sole_holder = worker.skills.intersection(&needed).any(|cap| {
                !state
                    .registry
                    .workers()
                    .iter()
                    .any(|other| other.id != id && other.skills.contains(cap))
            });
            if sole_holder {
                debug!(worker = %id.short(), "kept idle worker holding a needed capability");
                continue;
            }
            if state.registry.unregister(id).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn wait_until(&self, done: impl Fn(&PoolState) -> bool) {
        loop {
            let notified = self.shared.wake.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            let finished = {
                let state = self.shared.state.lock();
                done(&state)
            };
            if finished {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no task is queued or running and no group can still
    /// start. Returns false if `timeout` elapsed first.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let wait = self.wait_until(PoolState::is_finished);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Stop the health timer, let running attempts drain for
    /// `shutdown_grace_ms`, cancel the rest and release every worker.
    /// Queued tasks that never started stay pending.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let abandoned = {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            let abandoned = state.queue.len();
            state.queue.clear();
            abandoned
        };
        let health = self.shared.health.lock().take();
        if let Some(handle) = health {
            let _ = handle.await;
        }

        let grace = self.shared.config.pool.shutdown_grace();
        let drained = tokio::time::timeout(grace, self.wait_until(|s| s.running.is_empty()))
            .await
            .is_ok();

        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let orchestrator = &self.shared.orchestrator;
            if !drained {
                let cancelled: Vec<(TaskId, RunningTask)> = state.running.drain().collect();
                for (task_id, run) in cancelled {
                    run.abort.abort();
                    let message = "cancelled by shutdown";
                    if let Err(err) = orchestrator.fail_task(task_id, message) {
                        debug!(task = %task_id.short(), %err, "cancel not recorded");
                    }
                    state.registry.release_task(run.worker, task_id);
                    state.attempts.push(ExecutionResult::new(
                        task_id,
                        run.worker,
                        ExecutionStatus::Cancelled,
                        run.start_time,
                        run.retries,
                        Some(message.to_string()),
                    ));
                }
            }
            let ids: Vec<WorkerId> = state.registry.workers().iter().map(|w| w.id).collect();
            for id in ids {
                state.registry.set_offline(id);
                if let Err(err) = state.registry.unregister(id) {
                    debug!(worker = %id.short(), %err, "worker not released");
                }
            }
            info!(
                completed = state.completed,
                failed = state.failures.len(),
                abandoned,
                "pool shut down"
            );
        }
        self.shared.wake.notify_waiters();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.state.lock();
        let stats = state.registry.statistics();
        let avg_task_duration_ms = if state.completed == 0 {
            0.0
        } else {
            state.total_duration.as_secs_f64() * 1000.0 / state.completed as f64
        };
        let elapsed = self.shared.created.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            state.completed as f64 / elapsed
        } else {
            0.0
        };
        PoolSnapshot {
            total_workers: stats.total,
            active_workers: stats.busy,
            idle_workers: stats.idle,
            queued_tasks: state.queue.len(),
            running_tasks: state.running.len(),
            completed_tasks: state.completed,
            failed_tasks: state.failures.len(),
            avg_task_duration_ms,
            throughput,
        }
    }

    /// Progress of the current DAG, in group mode.
    pub fn group_progress(&self) -> Option<GroupProgress> {
        let state = self.shared.state.lock();
        state.groups.as_ref().map(|g| g.scheduler.progress())
    }

    pub fn progress_summary(&self) -> Option<String> {
        let state = self.shared.state.lock();
        state
            .groups
            .as_ref()
            .map(|g| g.scheduler.generate_progress_summary())
    }

    pub fn report(&self) -> ExecutionReport {
        let state = self.shared.state.lock();
        ExecutionReport {
            attempts: state.attempts.clone(),
            failures: state.failures.clone(),
            completed: state.completed,
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PoolManager")
            .field("workers", &state.registry.len())
            .field("queued", &state.queue.len())
            .field("running", &state.running.len())
            .finish()
    }
}
