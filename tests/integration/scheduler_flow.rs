//! Scheduler integration tests.
//!
//! These tests run whole plans through the `Scheduler` with a
//! `FakeTaskRunner`, checking dispatch order, base branches and stall
//! diagnosis as seen through the public event stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use convoy::core::task::{Plan, TaskId, WorkerStatus};
use convoy::orchestration::{Scheduler, SchedulerEvent};

use crate::fixtures::{status_of, test_task, FakeTaskRunner};

/// Test: Diamond plan
/// Given A -> {B, C} -> D
/// When the plan runs
/// Then B and C run concurrently, D starts last and forks from B
#[tokio::test]
async fn test_diamond_plan_runs_to_completion() {
    let runner = Arc::new(FakeTaskRunner::new().delay("b", 30).delay("c", 30));
    let plan = Plan::new(
        "diamond",
        vec![
            test_task("a", &[]),
            test_task("b", &["a"]),
            test_task("c", &["a"]),
            test_task("d", &["b", "c"]),
        ],
    );
    let (tx, mut rx) = mpsc::channel(64);
    let mut scheduler = Scheduler::new(plan, runner.clone()).with_events(tx);

    let results = scheduler.run().await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.status == WorkerStatus::Completed));

    let launched = runner.launched.lock().unwrap().clone();
    assert_eq!(launched[0], ("a".to_string(), None));
    assert_eq!(launched[3], ("d".to_string(), Some("plan/b".to_string())));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    // b and c are both started before either finishes.
    let started_c = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == "c"))
        .unwrap();
    let finished_b = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskCompleted { task_id } if task_id.as_str() == "b"))
        .unwrap();
    assert!(started_c < finished_b);
    assert_eq!(
        events.last(),
        Some(&SchedulerEvent::AllTasksFinished {
            completed: 4,
            failed: 0
        })
    );
}

/// Test: Failure propagation
/// Given a -> b -> c and an independent d
/// When a fails
/// Then b and c are blocked, d still completes, and nothing hangs
#[tokio::test]
async fn test_failure_blocks_transitive_dependents_only() {
    let runner = Arc::new(
        FakeTaskRunner::new()
            .status("a", WorkerStatus::Failed)
            .delay("d", 40),
    );
    let plan = Plan::new(
        "chain",
        vec![
            test_task("a", &[]),
            test_task("b", &["a"]),
            test_task("c", &["b"]),
            test_task("d", &[]),
        ],
    );
    let mut scheduler = Scheduler::new(plan, runner.clone());

    let results = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler must terminate");

    assert_eq!(status_of(&results, "a"), WorkerStatus::Failed);
    assert_eq!(status_of(&results, "d"), WorkerStatus::Completed);
    for id in ["b", "c"] {
        let result = results.iter().find(|r| r.task_id.as_str() == id).unwrap();
        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result
            .error
            .as_ref()
            .unwrap()
            .contains("blocked by failed dependency a"));
    }
    let mut launched = runner.launched_ids();
    launched.sort();
    assert_eq!(launched, vec!["a", "d"]);
}

/// Test: Exactly one result per task
/// Given a plan mixing completed, incomplete and cyclic tasks
/// When the plan runs
/// Then every task has exactly one terminal result
#[tokio::test]
async fn test_every_task_gets_exactly_one_result() {
    let runner = Arc::new(FakeTaskRunner::new().status("slow", WorkerStatus::Incomplete));
    let plan = Plan::new(
        "mixed",
        vec![
            test_task("ok", &[]),
            test_task("slow", &[]),
            test_task("after-slow", &["slow"]),
            test_task("x", &["y"]),
            test_task("y", &["x"]),
            test_task("after-cycle", &["x"]),
        ],
    );
    let results = Scheduler::new(plan.clone(), runner).run().await;

    let ids: Vec<TaskId> = results.iter().map(|r| r.task_id.clone()).collect();
    let expected: Vec<TaskId> = plan.tasks.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, expected);

    assert_eq!(status_of(&results, "ok"), WorkerStatus::Completed);
    assert_eq!(status_of(&results, "slow"), WorkerStatus::Incomplete);
    assert_eq!(status_of(&results, "after-slow"), WorkerStatus::Failed);
    for id in ["x", "y", "after-cycle"] {
        let result = results.iter().find(|r| r.task_id.as_str() == id).unwrap();
        assert_eq!(result.status, WorkerStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("Dependency deadlock"));
    }
}

/// Test: Independent schedulers
/// Given two plans scheduled at the same time
/// Then neither sees the other's state
#[tokio::test]
async fn test_two_plans_schedule_concurrently() {
    let first = Plan::new("one", vec![test_task("a", &[]), test_task("b", &["a"])]);
    let second = Plan::new("two", vec![test_task("a", &[]), test_task("c", &[])]);
    let mut s1 = Scheduler::new(first, Arc::new(FakeTaskRunner::new().delay("a", 20)));
    let mut s2 = Scheduler::new(
        second,
        Arc::new(FakeTaskRunner::new().status("a", WorkerStatus::Failed)),
    );

    let (r1, r2) = tokio::join!(s1.run(), s2.run());
    assert!(r1.iter().all(|r| r.status == WorkerStatus::Completed));
    assert_eq!(status_of(&r2, "a"), WorkerStatus::Failed);
    assert_eq!(status_of(&r2, "c"), WorkerStatus::Completed);
}
