//! Isolated, branch-scoped workspaces.
//!
//! Each task runs in its own linked git worktree under the workspace root.
//! The worktree is disposable; the branch it checks out survives teardown so
//! the integrator can merge it later.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::git::{GitOps, WorktreeInfo};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_warn, Error, Result};

pub const MAX_BRANCH_NAME_LEN: usize = 100;

static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9_/-]*[A-Za-z0-9])?$").expect("valid branch regex")
});

/// Check a branch/workspace identifier against the allow-list.
///
/// Identifiers end up as arguments to git and as directory names, so they
/// are rejected here before any process or filesystem side effect.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let reject = |why: &str| Err(Error::Validation(format!("invalid branch name {:?}: {}", name, why)));

    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > MAX_BRANCH_NAME_LEN {
        return reject("longer than 100 characters");
    }
    if name.contains("..") {
        return reject("contains '..'");
    }
    if name.contains("//") {
        return reject("contains '//'");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return reject("starts or ends with '/'");
    }
    if !BRANCH_RE.is_match(name) {
        return reject("must start and end alphanumeric and contain only [A-Za-z0-9-_/]");
    }
    Ok(())
}

/// Directory name for a branch's workspace. `.` never appears in a valid
/// branch name, so the mapping is injective.
pub fn workspace_name(branch: &str) -> String {
    branch.replace('/', ".")
}

/// A task's checked-out workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub branch: String,
    pub path: PathBuf,
    pub base_branch: Option<String>,
}

/// Creates and destroys task workspaces under a single root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: GitOps,
    root: PathBuf,
    baseline: Option<String>,
}

impl WorkspaceManager {
    pub fn new(git: GitOps, root: PathBuf) -> Self {
        Self {
            git,
            root,
            baseline: None,
        }
    }

    /// Branch whose tip seeds workspaces that have no base branch. Defaults
    /// to the main repository's HEAD.
    pub fn with_baseline(mut self, baseline: Option<String>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn workspace_path(&self, branch: &str) -> PathBuf {
        self.root.join(workspace_name(branch))
    }

    /// Create a fresh workspace for `branch`, rooted at `base_branch` if given
    /// or at the baseline tip otherwise. Any stale workspace or branch with
    /// the same name is removed first.
    pub async fn create_workspace(&self, branch: &str, base_branch: Option<&str>) -> Result<Workspace> {
        validate_branch_name(branch)?;
        if let Some(base) = base_branch {
            validate_branch_name(base)?;
            if base == branch {
                return Err(Error::Validation(format!(
                    "branch {} cannot be its own base",
                    branch
                )));
            }
        }

        let path = self.workspace_path(branch);
        self.remove_stale(branch, &path).await?;

        let git = self.git.clone();
        let root = self.root.clone();
        let baseline = self.baseline.clone();
        let name = workspace_name(branch);
        let branch_owned = branch.to_string();
        let base_owned = base_branch.map(String::from);
        let path_owned = path.clone();

        blocking(move || {
            let base_commit = match (&base_owned, &baseline) {
                (Some(base), _) => git.branch_commit(base)?.ok_or_else(|| {
                    Error::Workspace(format!("base branch {} does not exist", base))
                })?,
                (None, Some(baseline)) => git.branch_commit(baseline)?.ok_or_else(|| {
                    Error::Workspace(format!("baseline branch {} does not exist", baseline))
                })?,
                (None, None) => git.head_commit()?,
            };
            std::fs::create_dir_all(&root)?;
            git.create_worktree(&name, &path_owned, &branch_owned, base_commit)
                .map_err(|e| Error::Workspace(format!("creating workspace for {}: {}", branch_owned, e)))
        })
        .await?;

        self.ensure_checked_out(&path, branch).await?;

        clog!(
            "Workspace created: branch={} base={:?} path={}",
            branch,
            base_branch,
            path.display()
        );
        Ok(Workspace {
            branch: branch.to_string(),
            path,
            base_branch: base_branch.map(String::from),
        })
    }

    /// Fail, tearing the workspace down, unless `path` has `branch` checked
    /// out.
    async fn ensure_checked_out(&self, path: &Path, branch: &str) -> Result<()> {
        let actual = GitOps::worktree_branch(path).ok().flatten();
        if actual.as_deref() == Some(branch) {
            return Ok(());
        }
        clog_warn!(
            "Workspace {} is on {:?} instead of {}",
            path.display(),
            actual,
            branch
        );
        let _ = self.destroy_workspace(path).await;
        Err(Error::Workspace(format!(
            "workspace at {} resolved to {:?}, expected {}",
            path.display(),
            actual,
            branch
        )))
    }

    async fn remove_stale(&self, branch: &str, path: &Path) -> Result<()> {
        let registered = self.git.list_worktrees()?.into_iter().any(|wt| {
            wt.name == workspace_name(branch) || wt.branch.as_deref() == Some(branch)
        });
        if registered || path.exists() {
            clog_debug!("Removing stale workspace for {}", branch);
            self.destroy_workspace(path).await?;
            // A stale worktree for the branch may live elsewhere.
            for wt in self.git.list_worktrees()? {
                if wt.branch.as_deref() == Some(branch) {
                    self.destroy_workspace(&wt.path).await?;
                }
            }
        }
        let git = self.git.clone();
        let branch = branch.to_string();
        blocking(move || {
            if git.delete_branch(&branch)? {
                clog_debug!("Deleted stale branch {}", branch);
            }
            Ok(())
        })
        .await
    }

    /// Remove a workspace. Tries a libgit2 prune first, then falls back to
    /// deleting the directory and pruning stale metadata. Absent workspaces
    /// are a no-op.
    pub async fn destroy_workspace(&self, path: &Path) -> Result<()> {
        let git = self.git.clone();
        let path = path.to_path_buf();
        blocking(move || {
            let dir_name = path.file_name().and_then(|n| n.to_str()).map(String::from);
            let name = match git.find_worktree_name(&path)? {
                Some(name) => Some(name),
                None => match dir_name {
                    Some(n) if git.has_worktree_metadata(&n)? => Some(n),
                    _ => None,
                },
            };

            if name.is_none() && !path.exists() {
                return Ok(());
            }

            if let Some(name) = &name {
                if let Err(e) = git.prune_worktree(name) {
                    clog_warn!("Worktree prune failed for {}: {}", name, e);
                }
            }

            if path.exists() {
                clog_debug!("Falling back to directory removal for {}", path.display());
                std::fs::remove_dir_all(&path).map_err(|e| {
                    Error::Workspace(format!("removing {}: {}", path.display(), e))
                })?;
            }
            git.prune_stale_worktrees()?;
            if let Some(name) = &name {
                git.discard_worktree_metadata(name)?;
            }
            clog_debug!("Workspace destroyed: {}", path.display());
            Ok(())
        })
        .await
    }

    /// Active workspaces under this manager's root.
    pub fn list_workspaces(&self) -> Result<Vec<WorktreeInfo>> {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        Ok(self
            .git
            .list_worktrees()?
            .into_iter()
            .filter(|wt| {
                let path = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
                path.starts_with(&root)
            })
            .collect())
    }
}
