//! Integration test suite for convoy.
//!
//! These tests drive the public API against real temporary git
//! repositories. Build agents and build/test commands are scripted, so no
//! external tools besides `git` are needed.
//!
//! # Test Categories
//!
//! - `scheduler_flow`: dispatch order, races and stall handling
//! - `workspace_lifecycle`: worktree creation, forking and teardown
//! - `integration_e2e`: scheduling plus merging into the baseline

mod fixtures;

mod integration_e2e;
mod scheduler_flow;
mod workspace_lifecycle;
