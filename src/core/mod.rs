//! Core domain models for convoy.
//!
//! Plans, tasks and per-task results, plus the dependency graph used to
//! schedule and integrate them.

pub mod dag;
pub mod task;

pub use dag::PlanGraph;
pub use task::{
    FileOwnership, IntegrationResult, IntegrationStatus, Plan, Task, TaskId, WorkerResult,
    WorkerStatus,
};
