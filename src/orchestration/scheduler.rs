//! Dependency-aware parallel dispatcher.
//!
//! The Scheduler owns the state of one scheduling run over one `Plan`. It
//! launches every ready task concurrently through a [`TaskRunner`], waits for
//! whichever running task finishes first, and repeats until every task is
//! either completed or failed. Task-level problems never escape as errors:
//! each one is folded into that task's `WorkerResult`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::dag::PlanGraph;
use crate::core::task::{Plan, Task, TaskId, WorkerResult, WorkerStatus};
use crate::error::Error;
use crate::orchestration::runner::TaskRunner;
use crate::{clog, clog_debug, clog_error, clog_warn};

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task was handed to the runner.
    TaskStarted {
        task_id: TaskId,
        branch: String,
        /// Branch the task's workspace forks from, if any.
        base_branch: Option<String>,
    },
    TaskCompleted { task_id: TaskId },
    /// The agent ran out of budget without signalling completion.
    TaskIncomplete { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    /// No task could be scheduled and none was running.
    Stalled { unresolved: Vec<TaskId> },
    /// Every task reached a terminal state.
    AllTasksFinished { completed: usize, failed: usize },
}

/// Scheduler for one plan.
///
/// # Example
///
/// ```ignore
/// let runner = Arc::new(WorkspaceTaskRunner::new(workspaces, invoker));
/// let mut scheduler = Scheduler::new(plan, runner);
/// let results = scheduler.run().await;
/// ```
pub struct Scheduler {
    plan: Arc<Plan>,
    graph: PlanGraph,
    runner: Arc<dyn TaskRunner>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    max_concurrent: Option<usize>,
    cancel: Option<CancellationToken>,
    completed: HashSet<TaskId>,
    running: HashSet<TaskId>,
    /// Failed and incomplete tasks. Neither satisfies a dependent.
    failed: HashSet<TaskId>,
    results: HashMap<TaskId, WorkerResult>,
}

impl Scheduler {
    pub fn new(plan: Plan, runner: Arc<dyn TaskRunner>) -> Self {
        let graph = PlanGraph::new(&plan);
        Self {
            plan: Arc::new(plan),
            graph,
            runner,
            event_tx: None,
            max_concurrent: None,
            cancel: None,
            completed: HashSet::new(),
            running: HashSet::new(),
            failed: HashSet::new(),
            results: HashMap::new(),
        }
    }

    /// Emit lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Cap on simultaneously running tasks. Unbounded when unset.
    pub fn with_max_concurrent(mut self, max: Option<usize>) -> Self {
        self.max_concurrent = max.map(|m| m.max(1));
        self
    }

    /// Stop dispatching new tasks once `token` is cancelled. Running tasks
    /// are still awaited.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn completed(&self) -> &HashSet<TaskId> {
        &self.completed
    }

    pub fn failed(&self) -> &HashSet<TaskId> {
        &self.failed
    }

    pub fn running(&self) -> &HashSet<TaskId> {
        &self.running
    }

    fn total(&self) -> usize {
        self.graph.task_count()
    }

    fn is_resolved(&self, id: &TaskId) -> bool {
        self.completed.contains(id) || self.failed.contains(id)
    }

    /// Tasks in no state set whose dependencies have all completed.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut seen = HashSet::new();
        self.plan
            .tasks
            .iter()
            .filter(|task| seen.insert(&task.id))
            .filter(|task| {
                !self.completed.contains(&task.id)
                    && !self.running.contains(&task.id)
                    && !self.failed.contains(&task.id)
            })
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| self.completed.contains(dep) && !self.failed.contains(dep))
            })
            .collect()
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Branch produced by the task's first dependency. Other dependencies
    /// only order the task; their work arrives through integration.
    fn base_branch_for(&self, task: &Task) -> Option<String> {
        task.base_dependency()
            .and_then(|dep| self.results.get(dep))
            .and_then(|r| r.branch.clone())
    }

    async fn record(&mut self, result: WorkerResult) {
        let id = result.task_id.clone();
        self.running.remove(&id);
        let event = match result.status {
            WorkerStatus::Completed => {
                self.completed.insert(id.clone());
                SchedulerEvent::TaskCompleted { task_id: id.clone() }
            }
            WorkerStatus::Incomplete => {
                self.failed.insert(id.clone());
                SchedulerEvent::TaskIncomplete { task_id: id.clone() }
            }
            WorkerStatus::Failed => {
                self.failed.insert(id.clone());
                SchedulerEvent::TaskFailed {
                    task_id: id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                }
            }
        };
        clog!("task {} finished: {}", id, result.status);
        self.results.insert(id, result);
        self.emit(event).await;
    }

    fn reject_invalid_tasks(&mut self) -> Vec<WorkerResult> {
        let mut rejected = Vec::new();
        for (id, err) in PlanGraph::validate(&self.plan) {
            if self.failed.contains(&id) {
                continue;
            }
            clog_error!("task {} rejected: {}", id, err);
            self.failed.insert(id.clone());
            rejected.push(WorkerResult::failed(id, err.to_string()));
        }
        rejected
    }

    /// Fail every unresolved task, telling apart tasks blocked behind a
    /// failed dependency from tasks stuck on a cycle.
    fn diagnose_stall(&self) -> Vec<WorkerResult> {
        let cycles = self.graph.cycle_members();
        self.graph
            .topological_order()
            .into_iter()
            .filter(|id| !self.is_resolved(id))
            .map(|id| {
                let err = match self.graph.failed_ancestor(&id, &self.failed) {
                    Some(dependency) => Error::DependencyBlocked {
                        task: id.to_string(),
                        status: self
                            .results
                            .get(&dependency)
                            .map(|r| r.status)
                            .unwrap_or(WorkerStatus::Failed)
                            .to_string(),
                        dependency: dependency.to_string(),
                    },
                    None => {
                        if !cycles.contains(&id) {
                            clog_debug!("task {} is downstream of a dependency cycle", id);
                        }
                        Error::DependencyDeadlock { task: id.to_string() }
                    }
                };
                WorkerResult::failed(id, err.to_string())
            })
            .collect()
    }

    fn at_capacity(&self) -> bool {
        self.max_concurrent
            .map(|max| self.running.len() >= max)
            .unwrap_or(false)
    }

    /// Run every task to a terminal state. Returns one result per task, in
    /// plan order.
    pub async fn run(&mut self) -> Vec<WorkerResult> {
        clog!(
            "Scheduling plan {} ({} tasks)",
            self.plan.id,
            self.total()
        );

        for rejected in self.reject_invalid_tasks() {
            self.record(rejected).await;
        }

        let mut join_set: JoinSet<WorkerResult> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, TaskId> = HashMap::new();

        while self.completed.len() + self.failed.len() < self.total() {
            let cancelled = self
                .cancel
                .as_ref()
                .map(CancellationToken::is_cancelled)
                .unwrap_or(false);

            if !cancelled {
                let ready: Vec<Task> = self.ready_tasks().into_iter().cloned().collect();
                for task in ready {
                    if self.at_capacity() {
                        break;
                    }
                    let base_branch = self.base_branch_for(&task);
                    let id = task.id.clone();
                    self.running.insert(id.clone());
                    clog!(
                        "Dispatching task {} on {} (base {:?})",
                        id,
                        task.branch,
                        base_branch
                    );
                    self.emit(SchedulerEvent::TaskStarted {
                        task_id: id.clone(),
                        branch: task.branch.clone(),
                        base_branch: base_branch.clone(),
                    })
                    .await;
                    let fut = self.runner.run(task, base_branch);
                    let handle = join_set.spawn(fut);
                    in_flight.insert(handle.id(), id);
                }
            }

            if self.running.is_empty() {
                let unresolved: Vec<TaskId> = self
                    .graph
                    .topological_order()
                    .into_iter()
                    .filter(|id| !self.is_resolved(id))
                    .collect();
                if cancelled {
                    clog_warn!("Scheduling cancelled with {} task(s) not started", unresolved.len());
                    for id in unresolved {
                        self.record(WorkerResult::failed(id, "scheduling cancelled")).await;
                    }
                } else {
                    clog_error!("Scheduling stalled: {} task(s) can never run", unresolved.len());
                    self.emit(SchedulerEvent::Stalled { unresolved }).await;
                    for result in self.diagnose_stall() {
                        self.record(result).await;
                    }
                }
                break;
            }

            let joined = match (&self.cancel, cancelled) {
                (Some(token), false) => {
                    let token = token.clone();
                    tokio::select! {
                        joined = join_set.join_next_with_id() => joined,
                        _ = token.cancelled() => continue,
                    }
                }
                _ => join_set.join_next_with_id().await,
            };

            match joined {
                Some(Ok((task_handle, result))) => {
                    in_flight.remove(&task_handle);
                    self.record(result).await;
                }
                Some(Err(join_err)) => {
                    let Some(id) = in_flight.remove(&join_err.id()) else {
                        clog_error!("Lost track of a task runner: {}", join_err);
                        continue;
                    };
                    self.record(WorkerResult::failed(
                        id,
                        Error::TaskJoin(join_err.to_string()).to_string(),
                    ))
                    .await;
                }
                None => {
                    // Running set and join set disagree; nothing left to await.
                    for id in self.running.clone() {
                        self.record(WorkerResult::failed(id, "task runner vanished")).await;
                    }
                }
            }
        }

        self.emit(SchedulerEvent::AllTasksFinished {
            completed: self.completed.len(),
            failed: self.failed.len(),
        })
        .await;
        clog!(
            "Scheduling finished: {} completed, {} failed",
            self.completed.len(),
            self.failed.len()
        );

        let mut seen = HashSet::new();
        self.plan
            .tasks
            .iter()
            .filter(|t| seen.insert(&t.id))
            .filter_map(|t| self.results.get(&t.id).cloned())
            .collect()
    }
}
