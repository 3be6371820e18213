//! Build agent invocation and the self-correction loop.
//!
//! The invoker writes a brief into the task's workspace, then runs the
//! external agent repeatedly until it prints the completion token or the
//! iteration/time budget is spent. Progress is tracked by [`LoopPhase`]:
//!
//! ```text
//! Idle -> Running{1} -> Running{2} -> ... -> Completed | Incomplete | Failed
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{split_command, Config};
use crate::core::task::Task;
use crate::orchestration::brief::{self, LoopState, TaskBrief};
use crate::process::{CommandSpec, ProcessRunner};
use crate::util::tail;
use crate::{clog, clog_debug, clog_trace, clog_warn, Error, Result};

/// The configured agent command line, e.g. `claude --dangerously-skip-permissions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    base: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &Config) -> Self {
        Self::from_argv(split_command(config.effective_agent_command()))
    }

    pub fn from_argv(base: Vec<String>) -> Self {
        Self { base }
    }

    pub fn binary(&self) -> &str {
        self.base.first().map(|s| s.as_str()).unwrap_or("claude")
    }

    pub fn is_available(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Absolute path of the agent binary.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(self.binary())
            .map_err(|e| Error::AgentProcess(format!("agent binary {} not found: {}", self.binary(), e)))
    }

    /// Full argv for one non-interactive invocation.
    pub fn invocation(&self, prompt: &str, max_turns: u32) -> Vec<String> {
        let mut argv = self.base.clone();
        if argv.is_empty() {
            argv.push("claude".to_string());
        }
        argv.push("-p".to_string());
        argv.push(prompt.to_string());
        argv.push("--max-turns".to_string());
        argv.push(max_turns.to_string());
        argv
    }
}

/// Budget and instructions shared by every invocation.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_turns: u32,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub completion_token: String,
    /// Commands the brief tells the agent must succeed.
    pub verification: Vec<Vec<String>>,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_turns: config.effective_max_turns(),
            max_iterations: config.effective_max_iterations(),
            timeout: config.agent_timeout(),
            completion_token: config.effective_completion_token().to_string(),
            verification: vec![config.build_argv(), config.test_argv()],
        }
    }
}

/// Why a loop ended without the completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustedBudget {
    Iterations,
    WallClock,
}

/// State of one task's iteration loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Running { iteration: u32 },
    Completed,
    Incomplete(ExhaustedBudget),
    Failed(String),
}

/// Inputs that drive [`LoopPhase`] transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Start,
    IterationFinished { token_found: bool },
    DeadlineReached,
    ProcessError(String),
}

impl LoopPhase {
    /// Apply `event`. Terminal phases absorb every event.
    pub fn next(self, event: LoopEvent, max_iterations: u32) -> LoopPhase {
        match (self, event) {
            (LoopPhase::Idle, LoopEvent::Start) => LoopPhase::Running { iteration: 1 },
            (LoopPhase::Idle, _) => LoopPhase::Idle,
            (LoopPhase::Running { .. }, LoopEvent::IterationFinished { token_found: true }) => {
                LoopPhase::Completed
            }
            (LoopPhase::Running { iteration }, LoopEvent::IterationFinished { token_found: false }) => {
                if iteration < max_iterations {
                    LoopPhase::Running {
                        iteration: iteration + 1,
                    }
                } else {
                    LoopPhase::Incomplete(ExhaustedBudget::Iterations)
                }
            }
            (LoopPhase::Running { .. }, LoopEvent::DeadlineReached) => {
                LoopPhase::Incomplete(ExhaustedBudget::WallClock)
            }
            (LoopPhase::Running { .. }, LoopEvent::ProcessError(e)) => LoopPhase::Failed(e),
            (running @ LoopPhase::Running { .. }, LoopEvent::Start) => running,
            (terminal, _) => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopPhase::Completed | LoopPhase::Incomplete(_) | LoopPhase::Failed(_)
        )
    }
}

/// Result of driving the loop to a terminal phase.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub phase: LoopPhase,
    pub iterations: u32,
    /// Output of every iteration, in order.
    pub output: String,
}

/// Runs the build agent for a task inside its workspace.
#[derive(Clone)]
pub struct AgentInvoker {
    command: AgentCommand,
    settings: AgentSettings,
    runner: Arc<dyn ProcessRunner>,
}

impl AgentInvoker {
    pub fn new(command: AgentCommand, settings: AgentSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            command,
            settings,
            runner,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn prompt(&self, iteration: u32) -> String {
        if iteration <= 1 {
            format!(
                "Read {} in the current directory and complete the task it describes. \
                 Loop state is kept in {}/{}.",
                brief::BRIEF_FILE,
                brief::STATE_DIR,
                brief::STATE_FILE
            )
        } else {
            format!(
                "Iteration {} of {}. The task in {} is not finished: the completion line has \
                 not been printed. Re-check every acceptance criterion and verification \
                 command, fix what is missing, and continue.",
                iteration,
                self.settings.max_iterations,
                brief::BRIEF_FILE
            )
        }
    }

    /// Write the brief and drive the iteration loop to a terminal phase.
    pub async fn invoke(&self, task: &Task, workspace: &Path) -> AgentOutcome {
        let mut rendered = TaskBrief::new(task, &self.settings.completion_token);
        for argv in &self.settings.verification {
            rendered = rendered.verify_with(argv);
        }
        let body = rendered.render();

        let mut state = LoopState::start(self.settings.max_iterations, &self.settings.completion_token);
        if let Err(e) = brief::write_brief(workspace, &body).and_then(|_| state.write(workspace, &body)) {
            return AgentOutcome {
                phase: LoopPhase::Failed(format!("writing brief: {}", e)),
                iterations: 0,
                output: String::new(),
            };
        }

        let deadline = Instant::now() + self.settings.timeout;
        let max = self.settings.max_iterations;
        let mut output = String::new();
        let mut iterations = 0;
        let mut phase = LoopPhase::Idle.next(LoopEvent::Start, max);

        while let LoopPhase::Running { iteration } = phase {
            iterations = iteration;
            state.iteration = iteration;
            if let Err(e) = state.write(workspace, &body) {
                clog_warn!("task {}: could not persist loop state: {}", task.id, e);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                phase = phase.next(LoopEvent::DeadlineReached, max);
                break;
            }

            clog_debug!("task {}: agent iteration {}/{}", task.id, iteration, max);
            let event = self
                .run_iteration(iteration, workspace, remaining, &mut output)
                .await;
            phase = phase.next(event, max);
        }

        state.active = false;
        if let Err(e) = state.write(workspace, &body) {
            clog_warn!("task {}: could not persist final loop state: {}", task.id, e);
        }

        clog!(
            "task {}: agent loop finished as {:?} after {} iteration(s)",
            task.id,
            phase,
            iterations
        );
        AgentOutcome {
            phase,
            iterations,
            output,
        }
    }

    async fn run_iteration(
        &self,
        iteration: u32,
        workspace: &Path,
        remaining: Duration,
        output: &mut String,
    ) -> LoopEvent {
        let argv = self
            .command
            .invocation(&self.prompt(iteration), self.settings.max_turns);
        let spec = match CommandSpec::from_argv(&argv) {
            Ok(spec) => spec.current_dir(workspace).timeout(remaining),
            Err(e) => return LoopEvent::ProcessError(e.to_string()),
        };

        match self.runner.run(&spec).await {
            Ok(out) => {
                let text = out.combined();
                clog_trace!("agent output (iteration {}): {}", iteration, text);
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&text);

                if signals_completion(&text, &self.settings.completion_token) {
                    LoopEvent::IterationFinished { token_found: true }
                } else if !out.is_success() {
                    LoopEvent::ProcessError(format!(
                        "agent exited with {}: {}",
                        out.code
                            .map(|c| format!("code {}", c))
                            .unwrap_or_else(|| "a signal".to_string()),
                        tail(out.stderr.trim(), 500)
                    ))
                } else {
                    LoopEvent::IterationFinished { token_found: false }
                }
            }
            Err(Error::Timeout(_)) => LoopEvent::DeadlineReached,
            Err(e) => LoopEvent::ProcessError(e.to_string()),
        }
    }
}

/// The token only counts on a line of its own, so an agent quoting its
/// brief mid-sentence does not complete the task.
fn signals_completion(output: &str, token: &str) -> bool {
    output.lines().any(|line| line.trim() == token)
}
