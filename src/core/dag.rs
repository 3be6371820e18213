//! Dependency graph view over a `Plan`.
//!
//! `PlanGraph` indexes a plan's tasks in a petgraph `DiGraph` with edges
//! pointing from a dependency to its dependent. It is used to validate
//! plans, order tasks for integration, and explain why unresolved tasks can
//! never become ready.

use crate::core::task::{Plan, TaskId};
use crate::error::Error;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph of one plan.
pub struct PlanGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Task ids in plan order, first occurrence only.
    order: Vec<TaskId>,
    /// Declared dependency lists, in plan order.
    dependencies: HashMap<TaskId, Vec<TaskId>>,
}

impl PlanGraph {
    /// Build the graph. Duplicate ids keep their first definition and
    /// dependencies on unknown ids are left out of the graph; use
    /// [`PlanGraph::validate`] to report both.
    pub fn new(plan: &Plan) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = Vec::new();
        let mut dependencies = HashMap::new();

        for task in &plan.tasks {
            if index.contains_key(&task.id) {
                continue;
            }
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
            order.push(task.id.clone());
            dependencies.insert(task.id.clone(), task.dependencies.clone());
        }

        for id in &order {
            let to = index[id];
            for dep in &dependencies[id] {
                if let Some(&from) = index.get(dep) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        Self {
            graph,
            index,
            order,
            dependencies,
        }
    }

    /// Structural problems in the plan, one entry per offending task. A
    /// branch may be owned by one task only; later claimants are rejected.
    pub fn validate(plan: &Plan) -> Vec<(TaskId, Error)> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        let mut branches: HashMap<&str, &TaskId> = HashMap::new();
        let known: HashSet<&TaskId> = plan.task_ids();

        for task in &plan.tasks {
            if !seen.insert(&task.id) {
                issues.push((
                    task.id.clone(),
                    Error::Plan(format!("duplicate task id {}", task.id)),
                ));
                continue;
            }
            if let Some(owner) = branches.get(task.branch.as_str()) {
                issues.push((
                    task.id.clone(),
                    Error::Plan(format!(
                        "task {} reuses branch {} owned by task {}",
                        task.id, task.branch, owner
                    )),
                ));
                continue;
            }
            branches.insert(task.branch.as_str(), &task.id);
            if let Some(missing) = task.dependencies.iter().find(|d| !known.contains(d)) {
                issues.push((
                    task.id.clone(),
                    Error::Plan(format!(
                        "task {} depends on unknown task {}",
                        task.id, missing
                    )),
                ));
            }
        }
        issues
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth-first topological order: every dependency is emitted before its
    /// dependents, and independent tasks keep their plan order. Edges that
    /// close a cycle are ignored so every task still appears exactly once.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            self.visit(id, &mut visited, &mut out);
        }
        out
    }

    fn visit(&self, id: &TaskId, visited: &mut HashSet<TaskId>, out: &mut Vec<TaskId>) {
        if !self.index.contains_key(id) || !visited.insert(id.clone()) {
            return;
        }
        for dep in self.dependencies_of(id) {
            self.visit(dep, visited, out);
        }
        out.push(id.clone());
    }

    /// Tasks that sit on a dependency cycle (including self-dependencies).
    pub fn cycle_members(&self) -> HashSet<TaskId> {
        let mut members = HashSet::new();
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .map(|&n| self.graph.find_edge(n, n).is_some())
                    .unwrap_or(false);
            if cyclic {
                members.extend(
                    component
                        .into_iter()
                        .filter_map(|n| self.graph.node_weight(n).cloned()),
                );
            }
        }
        members
    }

    pub fn has_cycle(&self) -> bool {
        !self.cycle_members().is_empty()
    }

    /// The nearest failed task among `id`'s transitive dependencies, searched
    /// breadth-first in declared dependency order.
    pub fn failed_ancestor(&self, id: &TaskId, failed: &HashSet<TaskId>) -> Option<TaskId> {
        let mut queue: VecDeque<&TaskId> = self.dependencies_of(id).iter().collect();
        let mut seen: HashSet<&TaskId> = HashSet::new();
        while let Some(dep) = queue.pop_front() {
            if !seen.insert(dep) {
                continue;
            }
            if failed.contains(dep) {
                return Some(dep.clone());
            }
            queue.extend(self.dependencies_of(dep).iter());
        }
        None
    }
}

impl std::fmt::Debug for PlanGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
