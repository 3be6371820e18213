//! Best-effort teardown of task workspaces and merged branches.
//!
//! Cleanup never fails as a whole: every problem is recorded in the
//! `CleanupReport` and logged.

use std::path::PathBuf;

use crate::workspace::WorkspaceManager;
use crate::{clog, clog_debug, clog_warn};

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Workspaces that were removed.
    pub removed: Vec<PathBuf>,
    /// Branches that were deleted.
    pub deleted_branches: Vec<String>,
    /// Workspace paths or branch names that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all cleanup operations succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.deleted_branches.extend(other.deleted_branches);
        self.failed.extend(other.failed);
    }
}

/// Removes what a plan run left behind.
pub struct CleanupManager {
    workspaces: WorkspaceManager,
}

impl CleanupManager {
    pub fn new(workspaces: WorkspaceManager) -> Self {
        Self { workspaces }
    }

    /// Tear down a task's workspace, if one is still around.
    pub async fn cleanup_workspace(&self, branch: &str) -> CleanupReport {
        let mut report = CleanupReport::new();
        let path = self.workspaces.workspace_path(branch);
        if !path.exists() {
            return report;
        }
        match self.workspaces.destroy_workspace(&path).await {
            Ok(()) => report.removed.push(path),
            Err(e) => report.failed.push((path.display().to_string(), e.to_string())),
        }
        report
    }

    /// Delete a merged task branch. Its workspace must already be gone.
    pub fn cleanup_branch(&self, branch: &str) -> CleanupReport {
        let mut report = CleanupReport::new();
        match self.workspaces.git().delete_branch(branch) {
            Ok(true) => report.deleted_branches.push(branch.to_string()),
            Ok(false) => clog_debug!("Branch {} already gone", branch),
            Err(e) => report.failed.push((branch.to_string(), e.to_string())),
        }
        report
    }

    /// Workspaces first, then branches, for every listed branch.
    pub async fn cleanup_tasks(&self, branches: &[String]) -> CleanupReport {
        let mut report = CleanupReport::new();
        for branch in branches {
            report.merge(self.cleanup_workspace(branch).await);
        }
        if let Err(e) = self.workspaces.git().prune_stale_worktrees() {
            clog_warn!("Pruning stale worktrees failed: {}", e);
        }
        for branch in branches {
            report.merge(self.cleanup_branch(branch));
        }

        for (what, why) in &report.failed {
            clog_warn!("Cleanup failed for {}: {}", what, why);
        }
        clog!(
            "Cleanup: {} workspace(s) removed, {} branch(es) deleted, {} failure(s)",
            report.removed.len(),
            report.deleted_branches.len(),
            report.failed.len()
        );
        report
    }
}
