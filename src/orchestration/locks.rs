//! File lock table.
//!
//! The `LockManager` grants named resource locks (file paths) to a
//! (task, worker) pair. Multi-path acquisition is all-or-nothing and every
//! mutation goes through one table-wide mutex, so acquire, renew and the
//! expiry sweep never interleave.

use crate::core::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default time a lock stays valid without renewal.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// An active lock on one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub resource_path: PathBuf,
    pub holder_task: TaskId,
    pub holder_worker: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of an acquisition attempt. A conflict is an ordinary outcome.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Nothing was locked; these locks are held by other tasks.
    Conflict(Vec<FileLock>),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }

    pub fn conflicts(&self) -> &[FileLock] {
        match self {
            LockOutcome::Acquired => &[],
            LockOutcome::Conflict(locks) => locks,
        }
    }
}

/// Drop `.` components so `./src/a.rs` and `src/a.rs` name the same lock.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

pub struct LockManager {
    table: Mutex<HashMap<PathBuf, FileLock>>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        now + ttl
    }

    /// Lock every path for `task` or none of them.
    ///
    /// Paths already held by `task` itself are refreshed. Expired locks
    /// count as free.
    pub fn acquire_locks<I, P>(&self, task: TaskId, worker: WorkerId, paths: I) -> LockOutcome
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(|p| normalize_path(p.as_ref())).collect();
        let now = Utc::now();
        let mut table = self.table.lock();

        let conflicts: Vec<FileLock> = paths
            .iter()
            .filter_map(|path| table.get(path))
            .filter(|lock| lock.holder_task != task && !lock.is_expired_at(now))
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            debug!(task = %task.short(), conflicts = conflicts.len(), "lock acquisition refused");
            return LockOutcome::Conflict(conflicts);
        }

        let expires_at = self.expiry_from(now);
        for path in paths {
            table.insert(
                path.clone(),
                FileLock {
                    resource_path: path,
                    holder_task: task,
                    holder_worker: worker,
                    acquired_at: now,
                    expires_at,
                },
            );
        }
        LockOutcome::Acquired
    }

    /// Release everything `task` holds. Returns how many locks were dropped.
    pub fn release_locks(&self, task: TaskId) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, lock| lock.holder_task != task);
        before - table.len()
    }

    /// Heartbeat. Returns false when the task holds no locks.
    pub fn renew_locks(&self, task: TaskId) -> bool {
        let expires_at = self.expiry_from(Utc::now());
        let mut table = self.table.lock();
        let mut renewed = false;
        for lock in table.values_mut().filter(|l| l.holder_task == task) {
            lock.expires_at = expires_at;
            renewed = true;
        }
        renewed
    }

    /// Active locks on any of `paths`. Read-only.
    pub fn check_conflicts<I, P>(&self, paths: I) -> Vec<FileLock>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let now = Utc::now();
        let table = self.table.lock();
        paths
            .into_iter()
            .filter_map(|p| table.get(&normalize_path(p.as_ref())))
            .filter(|lock| !lock.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn cleanup_expired_locks(&self) -> usize {
        self.cleanup_expired_locks_at(Utc::now())
    }

    /// Sweep locks that expired before `now`.
    pub fn cleanup_expired_locks_at(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, lock| !lock.is_expired_at(now));
        let removed = before - table.len();
        if removed > 0 {
            debug!(removed, "expired locks swept");
        }
        removed
    }

    pub fn locks_held_by(&self, task: TaskId) -> Vec<FileLock> {
        let mut locks: Vec<_> = self
            .table
            .lock()
            .values()
            .filter(|l| l.holder_task == task)
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        locks
    }

    pub fn active_locks(&self) -> Vec<FileLock> {
        let now = Utc::now();
        let mut locks: Vec<_> = self
            .table
            .lock()
            .values()
            .filter(|l| !l.is_expired_at(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        locks
    }

    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        !self.check_conflicts([path]).is_empty()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.table.lock().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
