//! Task briefs and the persisted iteration-loop state.
//!
//! The brief is plain markdown written into the workspace for the build
//! agent to read. The loop state is a TOML front-matter header (between `+++`
//! lines) followed by the brief text, rewritten before every iteration so it
//! survives agent re-invocation.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::Task;
use crate::{Error, Result};

pub const BRIEF_FILE: &str = "CONVOY_TASK.md";
pub const STATE_DIR: &str = ".convoy";
pub const STATE_FILE: &str = "loop-state.md";

const FRONT_MATTER_FENCE: &str = "+++";

/// Everything the agent needs to know about one task.
#[derive(Debug, Clone)]
pub struct TaskBrief<'a> {
    task: &'a Task,
    completion_token: &'a str,
    verification: Vec<String>,
}

impl<'a> TaskBrief<'a> {
    pub fn new(task: &'a Task, completion_token: &'a str) -> Self {
        Self {
            task,
            completion_token,
            verification: Vec::new(),
        }
    }

    /// Add a verification command line that must exit successfully.
    pub fn verify_with(mut self, argv: &[String]) -> Self {
        if !argv.is_empty() {
            self.verification.push(argv.join(" "));
        }
        self
    }

    pub fn render(&self) -> String {
        let task = self.task;
        let mut out = String::new();

        let _ = writeln!(out, "# Task: {}\n", task.title);
        let _ = writeln!(out, "## Objective\n");
        if task.description.trim().is_empty() {
            let _ = writeln!(out, "{}\n", task.title);
        } else {
            let _ = writeln!(out, "{}\n", task.description.trim());
        }

        if !task.acceptance_criteria.is_empty() {
            let _ = writeln!(out, "## Acceptance Criteria\n");
            for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
                let _ = writeln!(out, "- [ ] {}. {}", i + 1, criterion);
            }
            out.push('\n');
        }

        if let Some(ownership) = task.file_ownership.as_ref().filter(|o| !o.is_empty()) {
            let _ = writeln!(out, "## File Ownership\n");
            let _ = writeln!(
                out,
                "Other tasks are working in parallel. Only touch the files listed here.\n"
            );
            if !ownership.create.is_empty() {
                let _ = writeln!(out, "You may create:");
                for pattern in &ownership.create {
                    let _ = writeln!(out, "- `{}`", pattern);
                }
                out.push('\n');
            }
            if !ownership.modify.is_empty() {
                let _ = writeln!(out, "You may modify:");
                for pattern in &ownership.modify {
                    let _ = writeln!(out, "- `{}`", pattern);
                }
                out.push('\n');
            }
        }

        if let Some(contract) = task.interface_contract.as_deref() {
            let _ = writeln!(out, "## Interface Contract\n\n{}\n", contract.trim());
        }

        let _ = writeln!(out, "## Completion\n");
        let _ = writeln!(
            out,
            "Output the exact line below only when every acceptance criterion is met \
             and every verification command succeeds. Never output it otherwise, even \
             to end the session.\n"
        );
        let _ = writeln!(out, "{}\n", self.completion_token);

        if !self.verification.is_empty() {
            let _ = writeln!(out, "## Verification\n");
            let _ = writeln!(out, "All of these must exit successfully:");
            for command in &self.verification {
                let _ = writeln!(out, "- `{}`", command);
            }
        }
        out
    }
}

/// Iteration-loop state persisted next to the brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub active: bool,
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_token: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl LoopState {
    pub fn start(max_iterations: u32, completion_token: &str) -> Self {
        Self {
            active: true,
            iteration: 0,
            max_iterations,
            completion_token: Some(completion_token.to_string()),
            started_at: Utc::now(),
        }
    }

    pub fn path_in(workspace: &Path) -> PathBuf {
        workspace.join(STATE_DIR).join(STATE_FILE)
    }

    /// Serialize as front matter followed by `body`.
    pub fn render(&self, body: &str) -> Result<String> {
        Ok(format!(
            "{fence}\n{header}{fence}\n\n{body}",
            fence = FRONT_MATTER_FENCE,
            header = toml::to_string(self)?,
            body = body
        ))
    }

    /// Parse a rendered record back into state and body.
    pub fn parse(text: &str) -> Result<(Self, String)> {
        let malformed = || Error::Validation("loop state is missing its +++ header".to_string());
        let rest = text
            .strip_prefix(FRONT_MATTER_FENCE)
            .and_then(|r| r.strip_prefix('\n'))
            .ok_or_else(malformed)?;
        let end = rest
            .find(&format!("\n{}", FRONT_MATTER_FENCE))
            .ok_or_else(malformed)?;
        let state: Self = toml::from_str(&rest[..end])?;
        let body = rest[end + 1 + FRONT_MATTER_FENCE.len()..]
            .trim_start_matches('\n')
            .to_string();
        Ok((state, body))
    }

    pub fn write(&self, workspace: &Path, body: &str) -> Result<()> {
        let path = Self::path_in(workspace);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render(body)?)?;
        Ok(())
    }

    pub fn read(workspace: &Path) -> Result<(Self, String)> {
        Self::parse(&std::fs::read_to_string(Self::path_in(workspace))?)
    }
}

/// Write the brief file into the workspace and return its path.
pub fn write_brief(workspace: &Path, brief: &str) -> Result<PathBuf> {
    let path = workspace.join(BRIEF_FILE);
    std::fs::write(&path, brief)?;
    Ok(path)
}

/// Remove the brief and loop state so they never land on the task branch.
pub fn remove_artifacts(workspace: &Path) -> Result<()> {
    let brief = workspace.join(BRIEF_FILE);
    if brief.exists() {
        std::fs::remove_file(brief)?;
    }
    let state_dir = workspace.join(STATE_DIR);
    if state_dir.exists() {
        std::fs::remove_dir_all(state_dir)?;
    }
    Ok(())
}
