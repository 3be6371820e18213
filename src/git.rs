use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature, StatusOptions};

use crate::{clog_debug, clog_warn, Error, Result};

/// A linked worktree registered with the main repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Thin libgit2 wrapper rooted at the main repository. Each call opens the
/// repository afresh, so a `GitOps` is cheap to clone and `Send`.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    pub(crate) fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub(crate) fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Convoy", "convoy@localhost"))?)
    }

    /// Short name of the branch checked out in the main repository.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if head.is_branch() {
            return Ok(head.shorthand().map(String::from));
        }
        Ok(None)
    }

    pub fn head_commit(&self) -> Result<Oid> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branch_commit(branch)?.is_some())
    }

    /// Tip commit of a local branch, `None` if the branch does not exist.
    pub fn branch_commit(&self, branch: &str) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Some(b.get().peel_to_commit()?.id()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(tip)
    }

    /// Create `branch` at `base` and check it out in a new linked worktree.
    pub fn create_worktree(&self, name: &str, path: &Path, branch: &str, base: Oid) -> Result<()> {
        clog_debug!(
            "GitOps::create_worktree name={} branch={} base={} path={}",
            name,
            branch,
            base,
            path.display()
        );
        let repo = self.repo()?;
        let commit = repo.find_commit(base)?;
        let branch_ref = repo.branch(branch, &commit, true)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, path, Some(&opts))?;
        Ok(())
    }

    /// Branch checked out in the worktree at `path`.
    pub fn worktree_branch(path: &Path) -> Result<Option<String>> {
        let repo = Repository::open(path)?;
        let head = repo.head()?;
        if head.is_branch() {
            Ok(head.shorthand().map(String::from))
        } else {
            Ok(None)
        }
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            let path = wt.path().to_path_buf();
            let branch = if path.exists() {
                Self::worktree_branch(&path).ok().flatten()
            } else {
                None
            };
            out.push(WorktreeInfo {
                name: name.to_string(),
                path,
                branch,
            });
        }
        Ok(out)
    }

    /// Name of the worktree registered at `path`, if any.
    pub fn find_worktree_name(&self, path: &Path) -> Result<Option<String>> {
        let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|wt| {
                let candidate = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
                candidate == wanted
            })
            .map(|wt| wt.name))
    }

    /// Prune a registered worktree, deleting its working tree.
    pub fn prune_worktree(&self, name: &str) -> Result<()> {
        clog_debug!("GitOps::prune_worktree name={}", name);
        let repo = self.repo()?;
        let worktree = repo.find_worktree(name)?;
        let _ = worktree.unlock();
        worktree.prune(Some(
            git2::WorktreePruneOptions::new()
                .valid(true)
                .working_tree(true)
                .locked(true),
        ))?;
        Ok(())
    }

    /// Drop worktree metadata whose directory no longer exists, including
    /// the `.git/worktrees/<name>` admin dir. Returns the number pruned.
    pub fn prune_stale_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            if wt.path().exists() {
                continue;
            }
            clog_debug!("Pruning stale worktree reference: {}", name);
            let _ = wt.unlock();
            if wt
                .prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ))
                .is_ok()
            {
                pruned += 1;
            }
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(pruned)
    }

    /// Whether `.git/worktrees/<name>` exists, readable or not.
    pub fn has_worktree_metadata(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        Ok(repo.path().join("worktrees").join(name).exists())
    }

    /// Remove `.git/worktrees/<name>` when it no longer describes a live
    /// worktree, including metadata too broken for libgit2 to open.
    pub fn discard_worktree_metadata(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        let admin_dir = repo.path().join("worktrees").join(name);
        if !admin_dir.exists() {
            return Ok(false);
        }
        let live = repo
            .find_worktree(name)
            .map(|wt| wt.path().exists())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        clog_debug!("Discarding worktree metadata {}", admin_dir.display());
        std::fs::remove_dir_all(&admin_dir)?;
        Ok(true)
    }

    /// Delete a local branch. Returns whether a branch was deleted.
    pub fn delete_branch(&self, branch: &str) -> Result<bool> {
        clog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        let deleted = match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                b.delete()?;
                true
            }
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(deleted)
    }

    /// Point the main repository's HEAD at `branch` and force the working
    /// tree to match it.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        clog_debug!("GitOps::checkout_branch branch={}", branch);
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| match e.code() {
                ErrorCode::NotFound => Error::Validation(format!("baseline branch {} not found", branch)),
                _ => Error::Git(e),
            })?
            .into_reference();
        let name = reference
            .name()
            .ok_or_else(|| Error::Validation(format!("branch {} has a non-UTF-8 name", branch)))?
            .to_string();
        let tree = reference.peel_to_tree()?;
        repo.checkout_tree(
            tree.as_object(),
            Some(git2::build::CheckoutBuilder::new().safe()),
        )?;
        repo.set_head(&name)?;
        Ok(())
    }

    pub fn is_dirty(path: &Path) -> Result<bool> {
        let repo = Repository::open(path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let dirty = !repo.statuses(Some(&mut opts))?.is_empty();
        Ok(dirty)
    }

    /// Stage everything in the worktree at `path` and commit it on HEAD.
    /// Returns `None` when there was nothing to commit.
    pub fn commit_all(path: &Path, message: &str) -> Result<Option<Oid>> {
        if !Self::is_dirty(path)? {
            return Ok(None);
        }
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Self::commit_index(&repo, &mut index, message).map(Some)
    }

    /// Stage specific paths (relative to the worktree root) and commit them.
    pub fn commit_paths(path: &Path, paths: &[PathBuf], message: &str) -> Result<Option<Oid>> {
        if paths.is_empty() {
            return Ok(None);
        }
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        for p in paths {
            index.add_path(p)?;
        }
        index.write()?;
        let tree_id = index.write_tree()?;
        let head = repo.head()?.peel_to_commit()?;
        if head.tree_id() == tree_id {
            return Ok(None);
        }
        Self::commit_index(&repo, &mut index, message).map(Some)
    }

    fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Result<Oid> {
        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = Self::signature(repo)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        clog_debug!("Commit created: {}", oid);
        Ok(oid)
    }

    /// Remove a file from the main working tree if git does not track it.
    /// Returns whether the file was removed.
    pub fn remove_if_untracked(&self, relative: &Path) -> Result<bool> {
        let repo = self.repo()?;
        let absolute = self.repo_path.join(relative);
        if !absolute.exists() {
            return Ok(false);
        }
        let status = match repo.status_file(relative) {
            Ok(s) => s,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => {
                clog_warn!("status_file failed for {}: {}", relative.display(), e);
                return Ok(false);
            }
        };
        if status.contains(git2::Status::WT_NEW) {
            clog_debug!("Removing untracked colliding file {}", relative.display());
            std::fs::remove_file(&absolute)?;
            return Ok(true);
        }
        Ok(false)
    }
}
