//! End-to-end integration tests.
//!
//! These tests schedule plans through real workspaces with a scripted agent
//! and integrate the resulting branches into `main`.

use std::sync::Arc;

use convoy::config::RegistryConfig;
use convoy::core::task::{IntegrationStatus, Plan, Task, TaskId, WorkerResult};
use convoy::orchestration::{Integrator, Scheduler, WorkspaceTaskRunner};
use convoy::process::ProcessRunner;

use crate::fixtures::{scripted_invoker, ScriptedAgent, TestRepo};

fn integrator(repo: &TestRepo, runner: Arc<dyn ProcessRunner>) -> Integrator {
    Integrator::new(repo.workspaces(), runner)
        .with_baseline(Some("main".to_string()))
        .with_registry(RegistryConfig::default())
        .with_verification(vec!["build".to_string()], vec!["test".to_string()])
}

fn completed(id: &str, branch: &str) -> WorkerResult {
    WorkerResult::completed(TaskId::from(id), branch, String::new())
}

/// Test: Setup plus two tools
/// Given S (no deps) and T1, T2 (deps=[S]) all completing
/// When the plan is scheduled and integrated
/// Then merges run in order, the index lists exactly T1's and T2's files,
/// verification runs, and 3 tasks are reported integrated
#[tokio::test]
async fn test_setup_and_two_tools_end_to_end() {
    let repo = TestRepo::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .writes(
                "Scaffold package",
                &[
                    ("packages/svc/package.json", "{ \"name\": \"svc\" }\n"),
                    ("packages/svc/src/setup.ts", "import './server';\n"),
                    ("packages/svc/src/server.ts", "export const server = {};\n"),
                ],
            )
            .writes(
                "Search tool",
                &[("packages/svc/src/tools/search.ts", "export const search = 1;\n")],
            )
            .writes(
                "Fetch tool",
                &[("packages/svc/src/tools/fetch.ts", "export const fetch = 2;\n")],
            ),
    );
    let plan = Plan::new(
        "service with two tools",
        vec![
            Task::new("s", "Scaffold package", "plan/s"),
            Task::new("t1", "Search tool", "plan/t1").with_dependencies(["s"]),
            Task::new("t2", "Fetch tool", "plan/t2").with_dependencies(["s"]),
        ],
    );

    let runner = Arc::new(WorkspaceTaskRunner::new(
        repo.workspaces(),
        scripted_invoker(agent.clone()),
    ));
    let results = Scheduler::new(plan.clone(), runner).run().await;
    assert!(results.iter().all(|r| r.is_completed()), "{:?}", results);

    let result = integrator(&repo, agent.clone()).integrate(&plan, &results).await;
    assert_eq!(result.status, IntegrationStatus::Success, "{:?}", result.errors);
    assert_eq!(result.message, "Integrated 3 tasks");
    assert_eq!(
        result.integrated,
        vec![TaskId::from("s"), TaskId::from("t1"), TaskId::from("t2")]
    );
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.plan.id, plan.id);

    let index = repo.read("packages/svc/src/tools/index.ts").unwrap();
    let entries: Vec<&str> = index.lines().filter(|l| l.starts_with("export")).collect();
    assert_eq!(
        entries,
        vec!["export * from './fetch';", "export * from './search';"]
    );
    let setup = repo.read("packages/svc/src/setup.ts").unwrap();
    assert!(setup.lines().any(|l| l == "import './tools/index';"));

    let commands = agent.commands.lock().unwrap().clone();
    assert_eq!(&commands[commands.len() - 2..], &["build", "test"]);

    // Regenerated files are committed; merged branches are gone.
    assert!(repo.git(&["status", "--porcelain"]).is_empty());
    for branch in ["plan/s", "plan/t1", "plan/t2"] {
        assert!(!repo.branch_exists(branch), "{} should be deleted", branch);
    }
    assert!(repo.workspaces().list_workspaces().unwrap().is_empty());
}

/// Test: Conflict stops integration
/// Given three branches where the second conflicts with main
/// When integrated
/// Then the result is failed and the third branch is never merged
#[tokio::test]
async fn test_conflict_on_second_branch_stops_integration() {
    let repo = TestRepo::new();
    repo.branch_with_file("main", "plan/one", "one.txt", "one\n");
    repo.branch_with_file("main", "plan/two", "README.md", "their readme\n");
    repo.branch_with_file("main", "plan/three", "three.txt", "three\n");
    repo.create_and_commit("README.md", "our readme\n", "edit readme");

    let plan = Plan::new(
        "conflicting",
        vec![
            Task::new("one", "One", "plan/one"),
            Task::new("two", "Two", "plan/two"),
            Task::new("three", "Three", "plan/three"),
        ],
    );
    let results = vec![
        completed("one", "plan/one"),
        completed("two", "plan/two"),
        completed("three", "plan/three"),
    ];
    let verifier = Arc::new(ScriptedAgent::new());

    let result = integrator(&repo, verifier.clone()).integrate(&plan, &results).await;
    assert_eq!(result.status, IntegrationStatus::Failed);
    assert_eq!(result.integrated, vec![TaskId::from("one")]);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("Merge conflict on branch plan/two"));
    assert!(result.errors[0].contains("README.md"));

    assert!(repo.read("one.txt").is_some());
    assert!(repo.read("three.txt").is_none());
    assert_eq!(repo.read("README.md").as_deref(), Some("our readme\n"));
    assert!(repo.git(&["status", "--porcelain"]).is_empty());
    assert!(verifier.commands.lock().unwrap().is_empty());
    assert!(repo.branch_exists("plan/three"));
}

/// Test: Re-running integration
/// Given branches already merged by a run whose tests failed
/// When integration runs again
/// Then every branch is skipped and the baseline does not move
#[tokio::test]
async fn test_rerun_over_merged_branches_is_idempotent() {
    let repo = TestRepo::new();
    repo.branch_with_file("main", "plan/a", "a.txt", "a\n");
    repo.branch_with_file("main", "plan/b", "b.txt", "b\n");
    let plan = Plan::new(
        "rerun",
        vec![Task::new("a", "A", "plan/a"), Task::new("b", "B", "plan/b")],
    );
    let results = vec![completed("a", "plan/a"), completed("b", "plan/b")];

    let failing = Arc::new(ScriptedAgent::new().failing("test"));
    let first = integrator(&repo, failing).integrate(&plan, &results).await;
    assert_eq!(first.status, IntegrationStatus::Failed);
    assert_eq!(first.integrated.len(), 2);
    assert!(repo.branch_exists("plan/a"));

    let head = repo.head();
    let second = integrator(&repo, Arc::new(ScriptedAgent::new()))
        .integrate(&plan, &results)
        .await;
    assert_eq!(second.status, IntegrationStatus::Success);
    assert!(second.integrated.is_empty());
    assert_eq!(second.skipped, vec![TaskId::from("a"), TaskId::from("b")]);
    assert_eq!(repo.head(), head);
}

/// Test: Incomplete work is not merged
#[tokio::test]
async fn test_incomplete_task_is_not_merged() {
    let repo = TestRepo::new();
    repo.branch_with_file("main", "plan/a", "a.txt", "a\n");
    let plan = Plan::new("partial", vec![Task::new("a", "A", "plan/a")]);
    let results = vec![WorkerResult::incomplete(
        TaskId::from("a"),
        "plan/a",
        String::new(),
    )];

    let result = integrator(&repo, Arc::new(ScriptedAgent::new()))
        .integrate(&plan, &results)
        .await;
    assert_eq!(result.status, IntegrationStatus::Incomplete);
    assert!(repo.read("a.txt").is_none());
}
