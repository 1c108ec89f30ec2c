//! Tier-by-tier group scheduler.
//!
//! The `TaskScheduler` walks task groups in topological tier order under a
//! global concurrency ceiling. A group of tier `k+1` never starts while any
//! group of tier `k` is not completed; a failed group therefore blocks every
//! later tier, and those groups are reported as blocked instead of being
//! waited on forever.

use crate::error::{Error, Result};
use crate::orchestration::grouper::{GroupId, TaskGroup};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State of a group in the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum GroupState {
    Queued,
    Running,
    Completed,
    Failed { reason: String },
}

impl GroupState {
    pub fn name(&self) -> &'static str {
        match self {
            GroupState::Queued => "queued",
            GroupState::Running => "running",
            GroupState::Completed => "completed",
            GroupState::Failed { .. } => "failed",
        }
    }
}

/// Serializable progress snapshot of the group walk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Queued groups that sit behind a failed tier.
    pub blocked: usize,
    /// Lowest tier that still has unfinished groups.
    pub current_level: Option<usize>,
    pub percent_complete: f64,
}

struct ScheduledGroup {
    group: TaskGroup,
    state: GroupState,
}

pub struct TaskScheduler {
    /// Groups in creation order.
    groups: Vec<ScheduledGroup>,
    index: HashMap<GroupId, usize>,
    max_concurrency: usize,
}

impl TaskScheduler {
    pub fn new(groups: Vec<TaskGroup>, max_concurrency: usize) -> Self {
        let index = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.id.clone(), i))
            .collect();
        Self {
            groups: groups
                .into_iter()
                .map(|group| ScheduledGroup {
                    group,
                    state: GroupState::Queued,
                })
                .collect(),
            index,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn group(&self, id: &GroupId) -> Option<&TaskGroup> {
        self.index.get(id).map(|&i| &self.groups[i].group)
    }

    pub fn state(&self, id: &GroupId) -> Option<&GroupState> {
        self.index.get(id).map(|&i| &self.groups[i].state)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&TaskGroup, &GroupState)> {
        self.groups.iter().map(|g| (&g.group, &g.state))
    }

    fn running_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.state == GroupState::Running)
            .count()
    }

    /// Lowest tier with a group that is not completed.
    fn current_level(&self) -> Option<usize> {
        self.groups
            .iter()
            .filter(|g| g.state != GroupState::Completed)
            .map(|g| g.group.level)
            .min()
    }

    /// Lowest tier holding a failed group.
    fn failed_level(&self) -> Option<usize> {
        self.groups
            .iter()
            .filter(|g| matches!(g.state, GroupState::Failed { .. }))
            .map(|g| g.group.level)
            .min()
    }

    fn is_blocked(&self, group: &ScheduledGroup) -> bool {
        group.state == GroupState::Queued
            && self
                .failed_level()
                .is_some_and(|level| group.group.level > level)
    }

    /// Most urgent queued group of the lowest unfinished tier.
    pub fn get_next_group(&self) -> Option<&TaskGroup> {
        let level = self.current_level()?;
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.state == GroupState::Queued && g.group.level == level)
            .min_by_key(|(i, g)| (g.group.priority, *i))
            .map(|(_, g)| &g.group)
    }

    pub fn can_accept_work(&self) -> bool {
        self.running_count() < self.max_concurrency
    }

    /// True while some group is running or can still run.
    pub fn has_work_remaining(&self) -> bool {
        self.groups.iter().any(|g| match g.state {
            GroupState::Running => true,
            GroupState::Queued => !self.is_blocked(g),
            _ => false,
        })
    }

    fn slot(&self, id: &GroupId) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::GroupNotFound(id.clone()))
    }

    pub fn start_group(&mut self, id: &GroupId) -> Result<()> {
        let i = self.slot(id)?;
        if self.groups[i].state != GroupState::Queued {
            return Err(Error::InvalidTransition {
                from: self.groups[i].state.name().to_string(),
                to: "running".to_string(),
            });
        }
        if self.current_level() != Some(self.groups[i].group.level) {
            return Err(Error::Validation(format!(
                "{} is on tier {} but an earlier tier is unfinished",
                id, self.groups[i].group.level
            )));
        }
        if !self.can_accept_work() {
            return Err(Error::Validation(format!(
                "cannot start {}: {} groups already running",
                id, self.max_concurrency
            )));
        }
        self.groups[i].state = GroupState::Running;
        Ok(())
    }

    pub fn complete_group(&mut self, id: &GroupId) -> Result<()> {
        let i = self.slot(id)?;
        if self.groups[i].state != GroupState::Running {
            return Err(Error::InvalidTransition {
                from: self.groups[i].state.name().to_string(),
                to: "completed".to_string(),
            });
        }
        self.groups[i].state = GroupState::Completed;
        Ok(())
    }

    /// Fail a queued or running group. Groups are never retried.
    pub fn fail_group(&mut self, id: &GroupId, reason: &str) -> Result<()> {
        let i = self.slot(id)?;
        if !matches!(
            self.groups[i].state,
            GroupState::Queued | GroupState::Running
        ) {
            return Err(Error::InvalidTransition {
                from: self.groups[i].state.name().to_string(),
                to: "failed".to_string(),
            });
        }
        self.groups[i].state = GroupState::Failed {
            reason: reason.to_string(),
        };
        Ok(())
    }

    /// Queued groups that can never start because an earlier tier failed.
    pub fn blocked_groups(&self) -> Vec<&TaskGroup> {
        self.groups
            .iter()
            .filter(|g| self.is_blocked(g))
            .map(|g| &g.group)
            .collect()
    }

    pub fn progress(&self) -> GroupProgress {
        let mut progress = GroupProgress {
            total: self.groups.len(),
            current_level: self.current_level(),
            ..Default::default()
        };
        for group in &self.groups {
            match group.state {
                GroupState::Queued => {
                    progress.queued += 1;
                    if self.is_blocked(group) {
                        progress.blocked += 1;
                    }
                }
                GroupState::Running => progress.running += 1,
                GroupState::Completed => progress.completed += 1,
                GroupState::Failed { .. } => progress.failed += 1,
            }
        }
        progress.percent_complete = if progress.total == 0 {
            100.0
        } else {
            progress.completed as f64 * 100.0 / progress.total as f64
        };
        progress
    }

    pub fn generate_progress_summary(&self) -> String {
        let p = self.progress();
        let mut summary = format!(
            "Groups: {}/{} completed ({:.1}%), {} running, {} queued, {} failed",
            p.completed, p.total, p.percent_complete, p.running, p.queued, p.failed
        );
        if p.blocked > 0 {
            summary.push_str(&format!(", {} blocked", p.blocked));
        }
        if let Some(level) = p.current_level {
            summary.push_str(&format!(" | tier {}", level));
        }
        summary
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("groups", &self.groups.len())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}
