//! Orchestration layer: running tasks and folding their work into the
//! baseline.
//!
//! The [`Scheduler`] dispatches ready tasks through a [`TaskRunner`], which
//! in production is a [`WorkspaceTaskRunner`] pairing an isolated workspace
//! with the [`AgentInvoker`]. The [`Integrator`] then merges the results.

pub mod agent;
pub mod brief;
pub mod integrator;
pub mod merge;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use agent::{AgentCommand, AgentInvoker, AgentOutcome, AgentSettings, LoopPhase};
pub use integrator::Integrator;
pub use merge::{BaselineMerger, MergeOutcome};
pub use registry::RegistryWriter;
pub use runner::{TaskRunner, WorkspaceTaskRunner};
pub use scheduler::{Scheduler, SchedulerEvent};
