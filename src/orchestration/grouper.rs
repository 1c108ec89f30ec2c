//! DAG task grouping.
//!
//! The grouper walks the DAG tier by tier and splits each tier into
//! bounded batches of tasks that share the same capability signature.
//! Groups never span tiers, so running the groups of one tier in any order
//! respects every dependency.

use crate::config::GroupingConfig;
use crate::core::{Capability, Task, TaskDAG, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Identifier of a task group, `group-<level>-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub(crate) fn new(level: usize, index: usize) -> Self {
        Self(format!("group-{}-{}", level, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A batch of same-tier tasks with one capability signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub tasks: Vec<Task>,
    pub required_skills: BTreeSet<Capability>,
    /// Most urgent member priority.
    pub priority: u32,
    /// Sum of member estimates.
    pub estimated_duration_ms: u64,
    /// Tier index in the DAG.
    pub level: usize,
    /// Staging directory for this group under the caller's base path.
    pub workspace: PathBuf,
}

impl TaskGroup {
    fn from_tasks(
        id: GroupId,
        level: usize,
        skills: BTreeSet<Capability>,
        tasks: Vec<Task>,
        base_path: &Path,
    ) -> Self {
        let priority = tasks.iter().map(|t| t.priority).min().unwrap_or(u32::MAX);
        let estimated_duration_ms = tasks.iter().map(|t| t.estimated_duration_ms).sum();
        let workspace = base_path.join(id.as_str());
        Self {
            id,
            tasks,
            required_skills: skills,
            priority,
            estimated_duration_ms,
            level,
            workspace,
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Outcome of [`TaskGrouper::validate_groups`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupValidation {
    /// Hard problems; scheduling must not start.
    pub errors: Vec<String>,
    /// Soft problems, such as an undersized remainder group.
    pub warnings: Vec<String>,
}

impl GroupValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Turn hard errors into a validation error.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(Error::Validation(self.errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskGrouper {
    config: GroupingConfig,
}

impl TaskGrouper {
    pub fn new(config: GroupingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    /// Partition the DAG into groups, tier by tier.
    ///
    /// Within a tier tasks are taken in (priority, creation) order and
    /// bucketed by capability signature in order of first appearance.
    pub fn group_tasks(&self, dag: &TaskDAG, base_path: &Path) -> Result<Vec<TaskGroup>> {
        let mut groups = Vec::new();

        for (level, tier) in dag.levels()?.into_iter().enumerate() {
            let mut buckets: Vec<(BTreeSet<Capability>, Vec<Task>)> = Vec::new();
            for id in tier {
                let task = dag.get_task(&id).ok_or(Error::TaskNotFound(id))?;
                match buckets.iter_mut().find(|(sig, _)| *sig == task.required_skills) {
                    Some((_, members)) => members.push(task.clone()),
                    None => buckets.push((task.required_skills.clone(), vec![task.clone()])),
                }
            }

            let mut index = 0;
            for (skills, members) in buckets {
                for chunk in self.split_bucket(members) {
                    groups.push(TaskGroup::from_tasks(
                        GroupId::new(level, index),
                        level,
                        skills.clone(),
                        chunk,
                        base_path,
                    ));
                    index += 1;
                }
            }
        }

        debug!(groups = groups.len(), tasks = dag.task_count(), "tasks grouped");
        Ok(groups)
    }

    /// Split one bucket into chunks of at most `max_group_size`.
    ///
    /// An undersized trailing chunk takes members from the end of the chunk
    /// before it, as long as that chunk stays at or above `min_group_size`.
    fn split_bucket(&self, members: Vec<Task>) -> Vec<Vec<Task>> {
        let max = self.config.max_group_size.max(1);
        let min = self.config.min_group_size.min(max);

        let mut chunks: Vec<Vec<Task>> = Vec::new();
        let mut members = members.into_iter().peekable();
        while members.peek().is_some() {
            chunks.push(members.by_ref().take(max).collect());
        }

        if chunks.len() >= 2 {
            let last = chunks.len() - 1;
            let shortfall = min.saturating_sub(chunks[last].len());
            let spare = chunks[last - 1].len().saturating_sub(min);
            let moved = shortfall.min(spare);
            if moved > 0 {
                let prev = &mut chunks[last - 1];
                let mut borrowed = prev.split_off(prev.len() - moved);
                borrowed.append(&mut chunks[last]);
                chunks[last] = borrowed;
            }
        }
        chunks
    }

    pub fn validate_groups(&self, groups: &[TaskGroup]) -> GroupValidation {
        let mut validation = GroupValidation::default();
        let mut seen: HashSet<TaskId> = HashSet::new();

        for group in groups {
            if group.is_empty() {
                validation.errors.push(format!("{} has no tasks", group.id));
                continue;
            }
            if group.len() > self.config.max_group_size {
                validation.errors.push(format!(
                    "{} has {} tasks, above the maximum of {}",
                    group.id,
                    group.len(),
                    self.config.max_group_size
                ));
            }
            if group.len() < self.config.min_group_size {
                validation.warnings.push(format!(
                    "{} has {} tasks, below the minimum of {}",
                    group.id,
                    group.len(),
                    self.config.min_group_size
                ));
            }
            for task in &group.tasks {
                if !seen.insert(task.id) {
                    validation
                        .errors
                        .push(format!("task {} appears in more than one group", task.id.short()));
                }
            }
        }
        validation
    }

    /// `min(groups, max_concurrent_groups)`, at least one when any group exists.
    pub fn calculate_optimal_concurrency(&self, groups: &[TaskGroup]) -> usize {
        if groups.is_empty() {
            return 0;
        }
        groups.len().min(self.config.max_concurrent_groups).max(1)
    }
}
