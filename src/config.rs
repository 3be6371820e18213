use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::expand_tilde;
use crate::{clog_debug, Error, Result};

pub const DEFAULT_AGENT_COMMAND: &str = "claude --dangerously-skip-permissions";
pub const DEFAULT_COMPLETION_TOKEN: &str = "<promise>TASK_COMPLETE</promise>";
pub const DEFAULT_MAX_TURNS: u32 = 50;
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 20 * 60;

/// Settings for `~/.convoy/convoy.toml`. Every field is optional; use the
/// accessor methods to get the effective value.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub workspace_dir: Option<String>,
    pub baseline_branch: Option<String>,
    pub agent_command: Option<String>,
    pub max_turns: Option<u32>,
    pub max_iterations: Option<u32>,
    pub agent_timeout_secs: Option<u64>,
    pub completion_token: Option<String>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    /// Limit for each of the build and test commands.
    pub verify_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Layout of the packages whose auto-registration index is regenerated after
/// merging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding one sub-directory per package.
    pub packages_dir: String,
    /// Package directory that is never regenerated.
    pub template_dir: String,
    /// Where registrable sources live, relative to the package.
    pub sources_dir: String,
    /// Source file extensions to list.
    pub extensions: Vec<String>,
    /// Index file name inside `sources_dir`.
    pub index_file: String,
    /// One line per source file; `{stem}` is replaced by the file stem.
    pub entry_template: String,
    /// Setup file relative to the package.
    pub setup_file: String,
    /// Line that imports the index from the setup file.
    pub setup_import: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            packages_dir: "packages".to_string(),
            template_dir: "_template".to_string(),
            sources_dir: "src/tools".to_string(),
            extensions: vec!["ts".to_string()],
            index_file: "index.ts".to_string(),
            entry_template: "export * from './{stem}';".to_string(),
            setup_file: "src/setup.ts".to_string(),
            setup_import: "import './tools/index';".to_string(),
        }
    }
}

impl Config {
    pub fn convoy_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".convoy"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::convoy_dir()?.join("convoy.toml"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::convoy_dir()?.join("workspaces")),
        }
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or(DEFAULT_AGENT_COMMAND)
    }

    pub fn effective_completion_token(&self) -> &str {
        self.completion_token
            .as_deref()
            .unwrap_or(DEFAULT_COMPLETION_TOKEN)
    }

    pub fn effective_max_turns(&self) -> u32 {
        self.max_turns.unwrap_or(DEFAULT_MAX_TURNS)
    }

    pub fn effective_max_iterations(&self) -> u32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS).max(1)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(
            self.agent_timeout_secs
                .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS),
        )
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(
            self.verify_timeout_secs
                .unwrap_or(DEFAULT_VERIFY_TIMEOUT_SECS)
                .max(1),
        )
    }

    /// Build command as an argument vector.
    pub fn build_argv(&self) -> Vec<String> {
        split_command(self.build_command.as_deref().unwrap_or("npm run build"))
    }

    /// Test command as an argument vector.
    pub fn test_argv(&self) -> Vec<String> {
        split_command(self.test_command.as_deref().unwrap_or("npm test"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: agent={:?} baseline={:?} max_concurrent={:?}",
            config.agent_command,
            config.baseline_branch,
            config.max_concurrent
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::convoy_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Split a configured command line into argv. No shell is involved, so
/// quoting is not interpreted.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.effective_agent_command(), DEFAULT_AGENT_COMMAND);
        assert_eq!(config.effective_completion_token(), DEFAULT_COMPLETION_TOKEN);
        assert_eq!(config.effective_max_iterations(), DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.build_argv(), vec!["npm", "run", "build"]);
        assert_eq!(config.test_argv(), vec!["npm", "test"]);
        assert!(config.max_concurrent.is_none());
        assert_eq!(
            config.verify_timeout(),
            Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_verify_timeout_from_toml() {
        let config: Config = toml::from_str("verify_timeout_secs = 90").unwrap();
        assert_eq!(config.verify_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_max_iterations_never_zero() {
        let config = Config {
            max_iterations: Some(0),
            ..Default::default()
        };
        assert_eq!(config.effective_max_iterations(), 1);
    }

    #[test]
    fn test_partial_toml_keeps_registry_defaults() {
        let config: Config = toml::from_str(
            r#"
            build_command = "cargo build"
            [registry]
            packages_dir = "servers"
            "#,
        )
        .unwrap();
        assert_eq!(config.build_argv(), vec!["cargo", "build"]);
        assert_eq!(config.registry.packages_dir, "servers");
        assert_eq!(config.registry.template_dir, "_template");
        assert_eq!(config.registry.extensions, vec!["ts"]);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_workspace_dir_expands_tilde() {
        let config = Config {
            workspace_dir: Some("~/ws".to_string()),
            ..Default::default()
        };
        let dir = config.workspaces_dir().unwrap();
        assert!(dir.ends_with("ws"));
        assert!(!dir.to_string_lossy().contains('~'));
    }
}
