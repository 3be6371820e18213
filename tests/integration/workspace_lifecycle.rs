//! Workspace lifecycle integration tests.
//!
//! These tests verify that workspaces are created on the right base,
//! replaced when stale, listed while alive and always torn down.

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use convoy::core::task::{Task, WorkerStatus};
use convoy::orchestration::{TaskRunner, WorkspaceTaskRunner};

use crate::fixtures::{scripted_invoker, ScriptedAgent, TestRepo};

/// Test: Forked workspace
/// Given a base branch carrying a file
/// When a workspace is created from it
/// Then the file is visible and the main checkout is untouched
#[tokio::test]
async fn test_workspace_forks_from_base_branch() {
    let repo = TestRepo::new();
    repo.branch_with_file("main", "plan/setup", "setup.txt", "setup\n");
    let manager = repo.workspaces();

    let ws = manager
        .create_workspace("plan/tool", Some("plan/setup"))
        .await
        .unwrap();
    assert_eq!(ws.branch, "plan/tool");
    assert_eq!(ws.base_branch.as_deref(), Some("plan/setup"));
    assert!(ws.path.join("setup.txt").exists());
    assert!(!repo.path.join("setup.txt").exists());
    assert_eq!(repo.current_branch(), "main");

    let listed = manager.list_workspaces().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].branch.as_deref(), Some("plan/tool"));

    assert_ok!(manager.destroy_workspace(&ws.path).await);
    assert!(!ws.path.exists());
    assert!(manager.list_workspaces().unwrap().is_empty());
    assert!(repo.branch_exists("plan/tool"));

    // Destroying twice is a no-op.
    assert_ok!(manager.destroy_workspace(&ws.path).await);
}

/// Test: Stale workspace replacement
/// Given a workspace left behind by an earlier attempt
/// When the same branch is created again
/// Then the old workspace and branch are replaced
#[tokio::test]
async fn test_stale_workspace_is_replaced() {
    let repo = TestRepo::new();
    let manager = repo.workspaces();

    let first = manager.create_workspace("plan/retry", None).await.unwrap();
    std::fs::write(first.path.join("leftover.txt"), "old attempt").unwrap();

    let second = manager.create_workspace("plan/retry", None).await.unwrap();
    assert_eq!(second.path, first.path);
    assert!(!second.path.join("leftover.txt").exists());
    assert_eq!(manager.list_workspaces().unwrap().len(), 1);

    manager.destroy_workspace(&second.path).await.unwrap();
}

/// Test: Rejected identifiers
/// Given malformed branch identifiers
/// Then nothing is created on disk or in git
#[tokio::test]
async fn test_invalid_identifiers_have_no_side_effects() {
    let repo = TestRepo::new();
    let manager = repo.workspaces();

    for bad in ["../escape", "a//b", "/lead", "trail/", "semi;colon", "sp ace", "-dash"] {
        assert_err!(manager.create_workspace(bad, None).await, "{} should be rejected", bad);
    }
    assert_err!(manager.create_workspace("plan/ok", Some("bad..base")).await);

    assert_eq!(std::fs::read_dir(repo.workspaces_dir.path()).unwrap().count(), 0);
    assert!(!repo.branch_exists("plan/ok"));
}

/// Test: Runner teardown
/// Given a scripted agent that writes a file
/// When the task runs
/// Then the work is committed on the task branch and the workspace is gone
#[tokio::test]
async fn test_runner_commits_work_and_tears_down() {
    let repo = TestRepo::new();
    let agent = Arc::new(ScriptedAgent::new().writes("Add notes", &[("notes/todo.md", "- item\n")]));
    let runner = WorkspaceTaskRunner::new(repo.workspaces(), scripted_invoker(agent));

    let result = runner
        .run(Task::new("n", "Add notes", "plan/notes"), None)
        .await;
    assert_eq!(result.status, WorkerStatus::Completed);
    assert!(repo.workspaces().list_workspaces().unwrap().is_empty());

    let files = repo.git(&["ls-tree", "-r", "--name-only", "plan/notes"]);
    let files: Vec<&str> = files.lines().collect();
    assert_eq!(files, vec!["README.md", "notes/todo.md"]);
}
