//! Plan and result data model.
//!
//! A `Plan` arrives fully formed from an external planner and is never
//! mutated by the scheduler. Each task run produces exactly one
//! `WorkerResult`; integration produces one `IntegrationResult`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Identifier of a task within a plan, as assigned by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Files a task may create or modify when work is spatially decomposed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOwnership {
    pub create: Vec<String>,
    pub modify: Vec<String>,
}

impl FileOwnership {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.modify.is_empty()
    }
}

/// An atomic unit of work with dependencies and acceptance criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Branch (and workspace) identifier for this task's work.
    pub branch: String,
    /// Tasks that must complete first. The first entry also supplies the
    /// base branch for this task's workspace.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ownership: Option<FileOwnership>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_contract: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: &str, branch: &str) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            description: String::new(),
            branch: branch.to_string(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            file_ownership: None,
            interface_contract: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(|d| TaskId::new(d)).collect();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ownership(mut self, ownership: FileOwnership) -> Self {
        self.file_ownership = Some(ownership);
        self
    }

    /// The dependency whose branch seeds this task's workspace.
    pub fn base_dependency(&self) -> Option<&TaskId> {
        self.dependencies.first()
    }
}

/// A decomposed body of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<Task>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(summary: &str, tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            summary: summary.to_string(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_ids(&self) -> HashSet<&TaskId> {
        self.tasks.iter().map(|t| &t.id).collect()
    }
}

/// Per-task outcome of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// The agent emitted the completion token.
    Completed,
    /// Budget ran out without the completion token. Not an error.
    Incomplete,
    /// The process errored, or the task could never run.
    Failed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Completed => write!(f, "completed"),
            WorkerStatus::Incomplete => write!(f, "incomplete"),
            WorkerStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn completed(task_id: TaskId, branch: &str, output: String) -> Self {
        Self {
            task_id,
            status: WorkerStatus::Completed,
            branch: Some(branch.to_string()),
            output: Some(output),
            error: None,
        }
    }

    pub fn incomplete(task_id: TaskId, branch: &str, output: String) -> Self {
        Self {
            task_id,
            status: WorkerStatus::Incomplete,
            branch: Some(branch.to_string()),
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: WorkerStatus::Failed,
            branch: None,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = Some(output);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkerStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Success,
    Failed,
    Incomplete,
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationStatus::Success => write!(f, "success"),
            IntegrationStatus::Failed => write!(f, "failed"),
            IntegrationStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Terminal outcome of integrating a plan's results into the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationResult {
    pub status: IntegrationStatus,
    pub message: String,
    pub plan: Plan,
    pub results: Vec<WorkerResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Tasks merged by this run, in merge order.
    #[serde(default)]
    pub integrated: Vec<TaskId>,
    /// Tasks whose branch was already merged.
    #[serde(default)]
    pub skipped: Vec<TaskId>,
}

impl IntegrationResult {
    pub fn new(
        status: IntegrationStatus,
        message: impl Into<String>,
        plan: &Plan,
        results: &[WorkerResult],
    ) -> Self {
        Self {
            status,
            message: message.into(),
            plan: plan.clone(),
            results: results.to_vec(),
            errors: Vec::new(),
            integrated: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == IntegrationStatus::Success
    }
}
