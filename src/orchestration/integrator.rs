//! Sequential integration of task branches into the baseline.
//!
//! The integrator is the only component that mutates the baseline. It runs
//! once after scheduling, merges every task branch in dependency order,
//! regenerates derived files, verifies the result and finally cleans up.
//! It never returns an error: every outcome is an `IntegrationResult`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cleanup::CleanupManager;
use crate::config::{Config, RegistryConfig};
use crate::core::dag::PlanGraph;
use crate::core::task::{
    IntegrationResult, IntegrationStatus, Plan, TaskId, WorkerResult, WorkerStatus,
};
use crate::git::GitOps;
use crate::orchestration::merge::{BaselineMerger, MergeOutcome};
use crate::orchestration::registry::RegistryWriter;
use crate::process::{CommandSpec, ProcessRunner};
use crate::util::{blocking, tail};
use crate::workspace::WorkspaceManager;
use crate::{clog, clog_error, clog_warn, Error, Result};

const VERIFICATION_OUTPUT_LIMIT: usize = 4000;
const REGISTRY_COMMIT_MESSAGE: &str = "convoy: regenerate registration index";

/// Outcome of the merge phase.
#[derive(Debug, Default)]
struct MergeReport {
    integrated: Vec<TaskId>,
    skipped: Vec<TaskId>,
    added: Vec<PathBuf>,
    /// First error, after which no further branch was attempted.
    error: Option<Error>,
}

pub struct Integrator {
    workspaces: WorkspaceManager,
    runner: Arc<dyn ProcessRunner>,
    baseline: Option<String>,
    registry: RegistryConfig,
    build: Vec<String>,
    test: Vec<String>,
    verify_timeout: Duration,
}

impl Integrator {
    pub fn new(workspaces: WorkspaceManager, runner: Arc<dyn ProcessRunner>) -> Self {
        let defaults = Config::default();
        Self {
            workspaces,
            runner,
            baseline: None,
            registry: RegistryConfig::default(),
            build: defaults.build_argv(),
            test: defaults.test_argv(),
            verify_timeout: defaults.verify_timeout(),
        }
    }

    pub fn from_config(
        config: &Config,
        workspaces: WorkspaceManager,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self::new(workspaces, runner)
            .with_baseline(config.baseline_branch.clone())
            .with_registry(config.registry.clone())
            .with_verification(config.build_argv(), config.test_argv())
            .with_verify_timeout(config.verify_timeout())
    }

    /// Branch to merge into. Defaults to the main repository's HEAD branch.
    pub fn with_baseline(mut self, baseline: Option<String>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Build and test argument vectors. An empty vector skips that step.
    pub fn with_verification(mut self, build: Vec<String>, test: Vec<String>) -> Self {
        self.build = build;
        self.test = test;
        self
    }

    /// Limit for each verification command. A command that runs past it
    /// fails verification.
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    fn git(&self) -> &GitOps {
        self.workspaces.git()
    }

    /// Merge, regenerate, verify and clean up. See the module docs.
    pub async fn integrate(&self, plan: &Plan, results: &[WorkerResult]) -> IntegrationResult {
        clog!(
            "Integrating plan {} ({} results)",
            plan.id,
            results.len()
        );

        if let Some(early) = Self::check_results(plan, results) {
            return early;
        }

        let graph = PlanGraph::new(plan);
        let order = graph.topological_order();
        let branches: Vec<(TaskId, String)> = order
            .iter()
            .filter_map(|id| {
                let branch = results
                    .iter()
                    .find(|r| &r.task_id == id)
                    .and_then(|r| r.branch.clone())
                    .or_else(|| plan.task(id).map(|t| t.branch.clone()))?;
                Some((id.clone(), branch))
            })
            .collect();

        // Merges
        let report = self.merge_all(&branches).await;
        let finish = |status, message: String, errors: Vec<String>, report: &MergeReport| {
            let mut result =
                IntegrationResult::new(status, message, plan, results).with_errors(errors);
            result.integrated = report.integrated.clone();
            result.skipped = report.skipped.clone();
            result
        };
        if let Some(err) = &report.error {
            clog_error!("Integration stopped: {}", err);
            return finish(
                IntegrationStatus::Failed,
                "Merge failed".to_string(),
                vec![err.to_string()],
                &report,
            );
        }

        // Derived artifacts
        if let Err(e) = self.regenerate_registry(&report.added).await {
            clog_error!("Registry regeneration failed: {}", e);
            return finish(
                IntegrationStatus::Failed,
                "Regenerating registration index failed".to_string(),
                vec![e.to_string()],
                &report,
            );
        }

        // Verification
        if let Err(e) = self.verify().await {
            clog_error!("{}", e);
            return finish(
                IntegrationStatus::Failed,
                "Verification failed".to_string(),
                vec![e.to_string()],
                &report,
            );
        }

        // Cleanup
        let names: Vec<String> = branches.into_iter().map(|(_, b)| b).collect();
        let cleanup = CleanupManager::new(self.workspaces.clone());
        let cleaned = cleanup.cleanup_tasks(&names).await;
        if !cleaned.is_success() {
            clog_warn!("Cleanup left {} item(s) behind", cleaned.failed.len());
        }

        let total = report.integrated.len() + report.skipped.len();
        let mut message = format!("Integrated {} tasks", total);
        if !report.skipped.is_empty() {
            message.push_str(&format!(" ({} already merged)", report.skipped.len()));
        }
        clog!("{}", message);
        finish(IntegrationStatus::Success, message, Vec::new(), &report)
    }

    /// Refuse to merge anything unless every task completed.
    fn check_results(plan: &Plan, results: &[WorkerResult]) -> Option<IntegrationResult> {
        let mut errors: Vec<String> = results
            .iter()
            .filter(|r| r.status == WorkerStatus::Failed)
            .map(|r| {
                format!(
                    "task {}: {}",
                    r.task_id,
                    r.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();
        for task in &plan.tasks {
            if !results.iter().any(|r| r.task_id == task.id) {
                errors.push(format!("task {}: no result", task.id));
            }
        }
        if !errors.is_empty() {
            clog_error!("Integration aborted: {} task(s) failed", errors.len());
            return Some(
                IntegrationResult::new(
                    IntegrationStatus::Failed,
                    format!("{} task(s) failed; nothing merged", errors.len()),
                    plan,
                    results,
                )
                .with_errors(errors),
            );
        }

        let incomplete: Vec<String> = results
            .iter()
            .filter(|r| r.status == WorkerStatus::Incomplete)
            .map(|r| format!("task {} did not signal completion", r.task_id))
            .collect();
        if !incomplete.is_empty() {
            clog_warn!("Integration skipped: {} task(s) incomplete", incomplete.len());
            return Some(
                IntegrationResult::new(
                    IntegrationStatus::Incomplete,
                    format!("{} task(s) incomplete; nothing merged", incomplete.len()),
                    plan,
                    results,
                )
                .with_errors(incomplete),
            );
        }
        None
    }

    async fn merge_all(&self, branches: &[(TaskId, String)]) -> MergeReport {
        let git = self.git().clone();
        let baseline = self.baseline.clone();
        let branches = branches.to_vec();

        let outcome = blocking(move || {
            let baseline = match baseline {
                Some(b) => b,
                None => git.current_branch()?.ok_or_else(|| {
                    Error::Validation("HEAD is detached; configure a baseline branch".to_string())
                })?,
            };
            let merger = BaselineMerger::new(git, baseline);
            merger.prepare()?;

            let mut report = MergeReport::default();
            for (id, branch) in branches {
                match merger.merge_branch(&branch) {
                    Ok(MergeOutcome::Merged { added, .. }) => {
                        report.integrated.push(id);
                        report.added.extend(added);
                    }
                    Ok(MergeOutcome::AlreadyMerged) => report.skipped.push(id),
                    Ok(MergeOutcome::Missing) => {
                        report.error = Some(Error::Validation(format!(
                            "branch {} for task {} does not exist",
                            branch, id
                        )));
                        break;
                    }
                    Ok(MergeOutcome::Conflict { files }) => {
                        report.error = Some(Error::MergeConflict { branch, files });
                        break;
                    }
                    Err(e) => {
                        report.error = Some(e);
                        break;
                    }
                }
            }
            Ok(report)
        })
        .await;

        outcome.unwrap_or_else(|e| MergeReport {
            error: Some(e),
            ..MergeReport::default()
        })
    }

    async fn regenerate_registry(&self, added: &[PathBuf]) -> Result<()> {
        let root = self.git().repo_path().to_path_buf();
        let registry = self.registry.clone();
        let added = added.to_vec();
        blocking(move || {
            let writer = RegistryWriter::new(&root, &registry);
            let packages: BTreeSet<String> = writer.affected_packages(&added);
            let changed = writer.regenerate(&packages)?;
            if let Some(commit) = GitOps::commit_paths(&root, &changed, REGISTRY_COMMIT_MESSAGE)? {
                clog!("Committed regenerated registry files as {}", commit);
            }
            Ok(())
        })
        .await
    }

    async fn verify(&self) -> Result<()> {
        for (step, argv) in [("build", &self.build), ("test", &self.test)] {
            if argv.is_empty() {
                continue;
            }
            let spec = CommandSpec::from_argv(argv)?
                .current_dir(self.git().repo_path())
                .timeout(self.verify_timeout);
            clog!("Verification {}: {}", step, spec.display());
            let output = self
                .runner
                .run(&spec)
                .await
                .map_err(|e| Error::Verification {
                    step: step.to_string(),
                    output: e.to_string(),
                })?;
            if !output.is_success() {
                return Err(Error::Verification {
                    step: step.to_string(),
                    output: tail(&output.combined(), VERIFICATION_OUTPUT_LIMIT),
                });
            }
        }
        Ok(())
    }
}
