//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories on branch `main`
//! - A scripted build agent that writes files and prints the completion token
//! - Scripted task runners for scheduler tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use convoy::core::task::{Task, WorkerResult, WorkerStatus};
use convoy::git::GitOps;
use convoy::orchestration::{AgentCommand, AgentInvoker, AgentSettings, TaskRunner};
use convoy::process::{CommandSpec, ProcessOutput, ProcessRunner};
use convoy::workspace::WorkspaceManager;

pub const TOKEN: &str = "<promise>TASK_COMPLETE</promise>";

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Root for task workspaces.
    pub workspaces_dir: TempDir,
}

impl TestRepo {
    /// Create a new test repository with an initial commit on `main`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let workspaces_dir = TempDir::new().expect("Failed to create workspace directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Self {
            temp_dir,
            path,
            workspaces_dir,
        };

        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo.git(&["branch", "-M", "main"]);
        repo
    }

    /// Run git in the repository, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Write a file and commit it on the current branch.
    pub fn create_and_commit(&self, filename: &str, content: &str, message: &str) {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&file_path, content).expect("Failed to write file");
        self.git(&["add", filename]);
        self.git(&["commit", "-m", message]);
    }

    /// Create `branch` from `from` with one committed file, then return to `main`.
    pub fn branch_with_file(&self, from: &str, branch: &str, filename: &str, content: &str) {
        self.git(&["checkout", "-b", branch, from]);
        self.create_and_commit(filename, content, &format!("add {}", filename));
        self.git(&["checkout", "main"]);
    }

    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(relative)).ok()
    }

    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open repository")
    }

    pub fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.git_ops(), self.workspaces_dir.path().to_path_buf())
            .with_baseline(Some("main".to_string()))
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Plays the build agent and the build/test commands.
///
/// As the agent it reads the task title from the brief in its working
/// directory, writes the files scripted for that title, and prints the
/// completion token. Any other program succeeds, unless listed in
/// `failing`.
#[derive(Default)]
pub struct ScriptedAgent {
    files: HashMap<String, Vec<(String, String)>>,
    failing: Vec<String>,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files to write when working on the task titled `title`.
    pub fn writes(mut self, title: &str, files: &[(&str, &str)]) -> Self {
        self.files.insert(
            title.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
        self
    }

    pub fn failing(mut self, program: &str) -> Self {
        self.failing.push(program.to_string());
        self
    }

    fn act(&self, cwd: &Path) -> std::io::Result<ProcessOutput> {
        let brief = std::fs::read_to_string(cwd.join("CONVOY_TASK.md"))?;
        let title = brief
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("# Task: "))
            .unwrap_or_default()
            .to_string();
        for (relative, content) in self.files.get(&title).into_iter().flatten() {
            let path = cwd.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(ProcessOutput::success(format!("worked on {}\n{}", title, TOKEN)))
    }
}

impl ProcessRunner for ScriptedAgent {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, convoy::Result<ProcessOutput>> {
        self.commands.lock().unwrap().push(spec.program.clone());
        Box::pin(async move {
            if self.failing.contains(&spec.program) {
                return Ok(ProcessOutput::failure(1, format!("{} failed", spec.program)));
            }
            if spec.program != "agent" {
                return Ok(ProcessOutput::success("ok"));
            }
            let cwd = spec.cwd.clone().expect("agent runs in its workspace");
            Ok(self.act(&cwd)?)
        })
    }
}

/// Agent invoker wired to `runner`, with the program name `agent`.
pub fn scripted_invoker(runner: Arc<dyn ProcessRunner>) -> AgentInvoker {
    let settings = AgentSettings {
        max_turns: 10,
        max_iterations: 2,
        timeout: Duration::from_secs(60),
        completion_token: TOKEN.to_string(),
        verification: vec![vec!["build".to_string()], vec!["test".to_string()]],
    };
    AgentInvoker::new(
        AgentCommand::from_argv(vec!["agent".to_string()]),
        settings,
        runner,
    )
}

/// Task runner that never touches git. Each task sleeps for its scripted
/// delay and finishes with its scripted status.
#[derive(Default)]
pub struct FakeTaskRunner {
    delays: HashMap<String, u64>,
    statuses: HashMap<String, WorkerStatus>,
    pub launched: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, id: &str, ms: u64) -> Self {
        self.delays.insert(id.to_string(), ms);
        self
    }

    pub fn status(mut self, id: &str, status: WorkerStatus) -> Self {
        self.statuses.insert(id.to_string(), status);
        self
    }

    pub fn launched_ids(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl TaskRunner for FakeTaskRunner {
    fn run(&self, task: Task, base_branch: Option<String>) -> BoxFuture<'static, WorkerResult> {
        self.launched
            .lock()
            .unwrap()
            .push((task.id.to_string(), base_branch));
        let delay = self.delays.get(task.id.as_str()).copied().unwrap_or(1);
        let status = self
            .statuses
            .get(task.id.as_str())
            .copied()
            .unwrap_or(WorkerStatus::Completed);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match status {
                WorkerStatus::Completed => WorkerResult::completed(task.id, &task.branch, "done".into()),
                WorkerStatus::Incomplete => {
                    WorkerResult::incomplete(task.id, &task.branch, "partial".into())
                }
                WorkerStatus::Failed => WorkerResult::failed(task.id, "agent crashed"),
            }
        })
    }
}

/// Task with branch `plan/<id>`.
pub fn test_task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, id, &format!("plan/{}", id)).with_dependencies(deps.iter().copied())
}

/// Result status for `id`.
pub fn status_of(results: &[WorkerResult], id: &str) -> WorkerStatus {
    results
        .iter()
        .find(|r| r.task_id.as_str() == id)
        .map(|r| r.status)
        .expect("no result for task")
}
