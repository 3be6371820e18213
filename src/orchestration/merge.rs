//! Merging task branches into the baseline.
//!
//! The `BaselineMerger` works directly in the main repository's working tree,
//! which must have the baseline checked out. Merges always produce a merge
//! commit, even when a fast-forward would be possible, so every task shows
//! up as one unit in the baseline history.

use std::collections::BTreeSet;
use std::path::PathBuf;

use git2::{BranchType, Delta, ErrorCode, Oid, Repository, ResetType};

use crate::git::GitOps;
use crate::{clog, clog_debug, clog_warn, Result};

/// What happened when merging one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A merge commit was created. `added` lists the files the branch
    /// introduced relative to the merge base.
    Merged { commit: Oid, added: Vec<PathBuf> },
    /// The branch tip is already reachable from the baseline.
    AlreadyMerged,
    /// The merge produced conflicts and was rolled back.
    Conflict { files: Vec<String> },
    /// No such local branch.
    Missing,
}

pub struct BaselineMerger {
    git: GitOps,
    baseline: String,
}

impl BaselineMerger {
    pub fn new(git: GitOps, baseline: impl Into<String>) -> Self {
        Self {
            git,
            baseline: baseline.into(),
        }
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    /// Check out the baseline in the main repository.
    pub fn prepare(&self) -> Result<()> {
        self.git.checkout_branch(&self.baseline)
    }

    /// Merge `branch` into the checked-out baseline.
    pub fn merge_branch(&self, branch: &str) -> Result<MergeOutcome> {
        let repo = self.git.repo()?;
        let theirs = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b.get().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(MergeOutcome::Missing),
            Err(e) => return Err(e.into()),
        };
        let ours = repo.head()?.peel_to_commit()?;

        let base = repo.merge_base(ours.id(), theirs.id())?;
        if base == theirs.id() {
            clog_debug!("{} already merged into {}", branch, self.baseline);
            return Ok(MergeOutcome::AlreadyMerged);
        }

        let added = added_files(&repo, base, theirs.id())?;
        for path in &added {
            self.git.remove_if_untracked(path)?;
        }

        let annotated = repo.find_annotated_commit(theirs.id())?;
        repo.merge(&[&annotated], None, None)?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            let mut files = BTreeSet::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    files.insert(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            clog_warn!(
                "Merge of {} into {} conflicts in {} file(s); aborting",
                branch,
                self.baseline,
                files.len()
            );
            repo.cleanup_state()?;
            repo.reset(ours.as_object(), ResetType::Hard, None)?;
            return Ok(MergeOutcome::Conflict {
                files: files.into_iter().collect(),
            });
        }

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = GitOps::signature(&repo)?;
        let message = format!("Merge branch '{}' into {}", branch, self.baseline);
        let commit = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        repo.cleanup_state()?;

        clog!("Merged {} into {} as {}", branch, self.baseline, commit);
        Ok(MergeOutcome::Merged { commit, added })
    }
}

/// Files present in `tip` but not in `base`.
fn added_files(repo: &Repository, base: Oid, tip: Oid) -> Result<Vec<PathBuf>> {
    let base_tree = repo.find_commit(base)?.tree()?;
    let tip_tree = repo.find_commit(tip)?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tip_tree), None)?;
    Ok(diff
        .deltas()
        .filter(|d| d.status() == Delta::Added)
        .filter_map(|d| d.new_file().path().map(PathBuf::from))
        .collect())
}
