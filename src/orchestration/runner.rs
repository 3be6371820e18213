//! Running a single task end to end: workspace, agent, teardown.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::core::task::{Task, WorkerResult};
use crate::git::GitOps;
use crate::orchestration::agent::{AgentInvoker, LoopPhase};
use crate::orchestration::brief;
use crate::util::blocking;
use crate::workspace::WorkspaceManager;
use crate::{clog, clog_error, clog_warn};

/// Executes one task and reports its outcome. The scheduler only talks to
/// this trait, so tests can substitute scripted runners.
pub trait TaskRunner: Send + Sync + 'static {
    /// Run `task`, forking its workspace from `base_branch` when given.
    /// Must never panic on task-level failure; every outcome is a result.
    fn run(&self, task: Task, base_branch: Option<String>) -> BoxFuture<'static, WorkerResult>;
}

/// Production runner: isolated worktree plus the build agent.
#[derive(Clone)]
pub struct WorkspaceTaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    workspaces: WorkspaceManager,
    invoker: AgentInvoker,
}

impl WorkspaceTaskRunner {
    pub fn new(workspaces: WorkspaceManager, invoker: AgentInvoker) -> Self {
        Self {
            inner: Arc::new(Inner { workspaces, invoker }),
        }
    }

    async fn execute(inner: Arc<Inner>, task: Task, base_branch: Option<String>) -> WorkerResult {
        let workspace = match inner
            .workspaces
            .create_workspace(&task.branch, base_branch.as_deref())
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                clog_error!("task {}: workspace creation failed: {}", task.id, e);
                return WorkerResult::failed(task.id.clone(), e.to_string());
            }
        };

        let outcome = inner.invoker.invoke(&task, &workspace.path).await;

        // Keep whatever the agent produced on the branch, minus our own files.
        let path = workspace.path.clone();
        let message = format!("convoy: {}", task.title);
        let committed = blocking(move || {
            brief::remove_artifacts(&path)?;
            GitOps::commit_all(&path, &message)
        })
        .await;

        if let Err(e) = inner.workspaces.destroy_workspace(&workspace.path).await {
            clog_warn!(
                "task {}: workspace teardown failed for {}: {}",
                task.id,
                workspace.path.display(),
                e
            );
        }

        if let Err(e) = committed {
            return WorkerResult::failed(task.id.clone(), format!("committing task work: {}", e))
                .with_output(outcome.output);
        }

        let result = match outcome.phase {
            LoopPhase::Completed => WorkerResult::completed(task.id.clone(), &task.branch, outcome.output),
            LoopPhase::Incomplete(_) => {
                WorkerResult::incomplete(task.id.clone(), &task.branch, outcome.output)
            }
            LoopPhase::Failed(error) => WorkerResult::failed(task.id.clone(), error).with_output(outcome.output),
            other => WorkerResult::failed(
                task.id.clone(),
                format!("agent loop stopped in non-terminal phase {:?}", other),
            ),
        };
        clog!("task {}: {}", task.id, result.status);
        result
    }
}

impl TaskRunner for WorkspaceTaskRunner {
    fn run(&self, task: Task, base_branch: Option<String>) -> BoxFuture<'static, WorkerResult> {
        Box::pin(Self::execute(Arc::clone(&self.inner), task, base_branch))
    }
}
