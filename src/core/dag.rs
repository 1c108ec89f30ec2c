//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskDAG` holds tasks as graph nodes with an edge `from -> to` for every
//! "`to` depends on `from`" relation. It rejects cycles, computes the
//! topological tiers the grouper works from, and answers readiness queries.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from a flat task list, wiring edges from each task's
    /// `dependencies`.
    ///
    /// # Errors
    /// Returns a validation error if a dependency names a task that is not
    /// in the list, or if the dependencies form a cycle.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task);
        }

        for task in dag.graph.node_weights() {
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|d| !dag.task_index.contains_key(d))
            {
                return Err(Error::Validation(format!(
                    "Task '{}' depends on unknown task {}",
                    task.title, dep
                )));
            }
        }

        dag.validate()?;
        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// Edges are wired for the task's own `dependencies` already in the
    /// graph and for graph tasks that list it as a dependency. Cycles are
    /// not checked here; `validate` and `levels` report them.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let deps: Vec<TaskId> = task.dependencies.iter().copied().collect();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);

        for dep in deps {
            if let Some(&from) = self.task_index.get(&dep) {
                self.graph.update_edge(from, index, ());
            }
        }
        let dependents: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| n != index && self.graph[n].dependencies.contains(&id))
            .collect();
        for to in dependents {
            self.graph.update_edge(index, to, ());
        }
        index
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// The dependency is also recorded on `to`'s task so the orchestrator
    /// sees it.
    ///
    /// # Errors
    /// Returns an error if either task is not in the DAG or if the edge
    /// would create a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", from)))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            task.dependencies.insert(*from);
        }
        Ok(())
    }

    /// Fail fast if the graph contains a cycle, or if a task lists an
    /// in-graph dependency that has no edge.
    pub fn validate(&self) -> Result<()> {
        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            for dep in &task.dependencies {
                if let Some(&from) = self.task_index.get(dep) {
                    if self.graph.find_edge(from, index).is_none() {
                        return Err(Error::Validation(format!(
                            "Task '{}' lists dependency {} without an edge",
                            task.title, dep
                        )));
                    }
                }
            }
        }
        self.topological_indices().map(|_| ())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    /// All tasks, in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// All `(from, to)` dependency pairs.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| {
                let (from, to) = self.graph.edge_endpoints(edge)?;
                Some((self.graph[from].id, self.graph[to].id))
            })
            .collect()
    }

    /// Tasks that `id` depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks not yet completed whose dependencies are all in `completed`.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if completed.contains(&task.id) {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep].id));
                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Tasks in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|index| &self.graph[index])
            .collect())
    }

    fn topological_indices(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let title = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.title.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", title))
        })
    }

    /// Topological tiers.
    ///
    /// Tier 0 holds tasks without dependencies; a task sits one tier above
    /// its deepest dependency. Within a tier tasks are ordered by priority,
    /// then creation order.
    pub fn levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let order = self.topological_indices()?;
        let mut depth: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());

        for &index in &order {
            let level = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, level);
        }

        let tier_count = depth.values().max().map_or(0, |max| max + 1);
        let mut tiers: Vec<Vec<&Task>> = vec![Vec::new(); tier_count];
        for (index, level) in depth {
            tiers[level].push(&self.graph[index]);
        }

        Ok(tiers
            .into_iter()
            .map(|mut tier| {
                tier.sort_by_key(|t| t.order_key());
                tier.into_iter().map(|t| t.id).collect()
            })
            .collect())
    }

    /// Consume the graph, yielding its tasks in insertion order.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
