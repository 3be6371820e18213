use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy::config::Config;
use convoy::core::task::{Plan, WorkerResult, WorkerStatus};
use convoy::git::GitOps;
use convoy::orchestration::{
    AgentCommand, AgentInvoker, AgentSettings, Integrator, Scheduler, SchedulerEvent,
    WorkspaceTaskRunner,
};
use convoy::process::{ProcessRunner, SystemProcessRunner};
use convoy::workspace::{validate_branch_name, WorkspaceManager};
use convoy::{clog, clog_warn, Result};

/// Convoy - dependency-aware parallel task dispatch and integration
#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONVOY_DEBUG=1  Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.convoy/convoy.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every task of a plan, then integrate the results
    Run {
        /// Plan file (JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Repository to work in (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Also write the per-task results to this file
        #[arg(long)]
        results: Option<PathBuf>,

        /// Stop after scheduling and print the per-task results
        #[arg(long)]
        no_integrate: bool,

        /// Maximum number of tasks running at once
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Integrate results of an earlier run
    Integrate {
        #[arg(long)]
        plan: PathBuf,

        /// Results file written by `run --results`
        #[arg(long)]
        results: PathBuf,

        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// List active task workspaces
    Workspaces {
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Check a branch identifier against the allow-list
    CheckBranch { name: String },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    convoy::log::init(cli.debug);

    let success = match cli.command {
        Command::Run {
            plan,
            repo,
            results,
            no_integrate,
            max_concurrent,
        } => run_plan(&plan, repo, results, no_integrate, max_concurrent)?,
        Command::Integrate {
            plan,
            results,
            repo,
        } => run_integrate(&plan, &results, repo)?,
        Command::Workspaces { repo } => run_workspaces(repo)?,
        Command::CheckBranch { name } => match validate_branch_name(&name) {
            Ok(()) => {
                println!("{} is a valid branch identifier", name);
                true
            }
            Err(e) => {
                eprintln!("{}", e);
                false
            }
        },
        Command::Config => {
            let config = Config::load()?;
            print!("{}", toml::to_string_pretty(&config)?);
            true
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn read_plan(path: &Path) -> Result<Plan> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

/// Workspace manager for `repo`, rooted under the configured workspace dir.
fn workspace_manager(config: &Config, repo: Option<PathBuf>) -> Result<WorkspaceManager> {
    let repo = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let git = GitOps::new(&repo)?;
    let repo_name = git
        .repo_path()
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string();
    let root = config.workspaces_dir()?.join(repo_name);
    std::fs::create_dir_all(&root)?;
    Ok(WorkspaceManager::new(git, root).with_baseline(config.baseline_branch.clone()))
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskStarted {
            task_id,
            branch,
            base_branch,
        } => match base_branch {
            Some(base) => eprintln!("  started   {} on {} (from {})", task_id, branch, base),
            None => eprintln!("  started   {} on {}", task_id, branch),
        },
        SchedulerEvent::TaskCompleted { task_id } => eprintln!("  completed {}", task_id),
        SchedulerEvent::TaskIncomplete { task_id } => eprintln!("  incomplete {}", task_id),
        SchedulerEvent::TaskFailed { task_id, error } => {
            eprintln!("  failed    {}: {}", task_id, error)
        }
        SchedulerEvent::Stalled { unresolved } => {
            eprintln!("  stalled with {} unresolved task(s)", unresolved.len())
        }
        SchedulerEvent::AllTasksFinished { completed, failed } => {
            eprintln!("Finished: {} completed, {} not completed", completed, failed)
        }
    }
}

fn run_plan(
    plan_path: &Path,
    repo: Option<PathBuf>,
    results_path: Option<PathBuf>,
    no_integrate: bool,
    max_concurrent: Option<usize>,
) -> Result<bool> {
    let config = Config::load()?;
    let plan = read_plan(plan_path)?;
    let workspaces = workspace_manager(&config, repo)?;
    clog!(
        "Run command: plan={} tasks={} repo={}",
        plan.id,
        plan.tasks.len(),
        workspaces.git().repo_path().display()
    );

    let agent = AgentCommand::from_config(&config);
    if !agent.is_available() {
        clog_warn!("Agent binary {} not found on PATH", agent.binary());
        eprintln!("warning: agent binary {} not found on PATH", agent.binary());
    }
    let process_runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new());
    let invoker = AgentInvoker::new(
        agent,
        AgentSettings::from_config(&config),
        Arc::clone(&process_runner),
    );
    let task_runner = Arc::new(WorkspaceTaskRunner::new(workspaces.clone(), invoker));

    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted: waiting for running tasks, no new tasks will start");
                on_interrupt.cancel();
            }
        });

        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        eprintln!("Running plan {} ({} tasks)", plan.id, plan.tasks.len());
        let mut scheduler = Scheduler::new(plan.clone(), task_runner)
            .with_events(tx)
            .with_max_concurrent(max_concurrent.or(config.max_concurrent))
            .with_cancellation(cancel);
        let results = scheduler.run().await;
        drop(scheduler);
        let _ = printer.await;
        results
    });

    if let Some(path) = &results_path {
        std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
    }

    if no_integrate {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(results.iter().all(|r| r.status == WorkerStatus::Completed));
    }

    let integrator = Integrator::from_config(&config, workspaces, process_runner);
    let result = rt.block_on(integrator.integrate(&plan, &results));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

fn run_integrate(plan_path: &Path, results_path: &Path, repo: Option<PathBuf>) -> Result<bool> {
    let config = Config::load()?;
    let plan = read_plan(plan_path)?;
    let results: Vec<WorkerResult> =
        serde_json::from_str(&std::fs::read_to_string(results_path)?)?;
    let workspaces = workspace_manager(&config, repo)?;
    clog!("Integrate command: plan={} results={}", plan.id, results.len());

    let integrator = Integrator::from_config(&config, workspaces, Arc::new(SystemProcessRunner::new()));
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(integrator.integrate(&plan, &results));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

fn run_workspaces(repo: Option<PathBuf>) -> Result<bool> {
    let config = Config::load()?;
    let workspaces = workspace_manager(&config, repo)?;
    let active = workspaces.list_workspaces()?;
    if active.is_empty() {
        println!("No active workspaces under {}", workspaces.root().display());
        return Ok(true);
    }
    for wt in active {
        println!(
            "{:<40} {}",
            wt.branch.as_deref().unwrap_or("(detached)"),
            wt.path.display()
        );
    }
    Ok(true)
}
