use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Agent process error: {0}")]
    AgentProcess(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Dependency deadlock: task {task} can never become ready (cycle or unresolved dependency)")]
    DependencyDeadlock { task: String },

    #[error("Task {task} blocked by {status} dependency {dependency}")]
    DependencyBlocked {
        task: String,
        dependency: String,
        status: String,
    },

    #[error("Merge conflict on branch {branch}: {}", files.join(", "))]
    MergeConflict { branch: String, files: Vec<String> },

    #[error("Verification failed during {step}: {output}")]
    Verification { step: String, output: String },
}

pub type Result<T> = std::result::Result<T, Error>;
