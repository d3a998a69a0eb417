//! Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Conductor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Where finished and stored tasks are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long finished tasks stay in the history.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".conductor/tasks.db")
}

fn default_retention_hours() -> u32 {
    168 // one week
}

/// How the coding agent is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable (and fixed leading arguments) of the agent CLI.
    #[serde(default = "default_agent_command")]
    pub command: String,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Directory for prompt files and launch scripts.
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// Prepended to every prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Text the agent prints when run-until-done work is finished.
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,

    /// Tool names whose `file_path` input is a write and needs a lock.
    #[serde(default = "default_write_tools")]
    pub write_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            default_model: None,
            script_dir: default_script_dir(),
            system_prompt: None,
            completion_marker: default_completion_marker(),
            write_tools: default_write_tools(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_script_dir() -> PathBuf {
    std::env::temp_dir().join("agent-conductor")
}

fn default_completion_marker() -> String {
    "TASK_COMPLETE".to_string()
}

fn default_write_tools() -> Vec<String> {
    ["Write", "Edit", "MultiEdit", "NotebookEdit"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Retry and iteration pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_token_limit_retries")]
    pub max_token_limit_retries: u32,

    /// First retry delay; doubled per consecutive retry.
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,

    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,

    /// Pause between run-until-done iterations.
    #[serde(default = "default_iteration_delay_seconds")]
    pub iteration_delay_seconds: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_token_limit_retries: default_max_token_limit_retries(),
            base_delay_seconds: default_base_delay_seconds(),
            max_delay_seconds: default_max_delay_seconds(),
            iteration_delay_seconds: default_iteration_delay_seconds(),
            max_consecutive_failures: default_max_consecutive_failures(),
            default_max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_token_limit_retries() -> u32 {
    3
}

fn default_base_delay_seconds() -> u64 {
    30
}

fn default_max_delay_seconds() -> u64 {
    600
}

fn default_iteration_delay_seconds() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    50
}

impl RetryConfig {
    /// Exponential backoff for the `attempt`-th retry (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let secs = self
            .base_delay_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_seconds);
        Duration::from_secs(secs)
    }

    pub fn iteration_delay(&self) -> Duration {
        Duration::from_secs(self.iteration_delay_seconds)
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve configuration: an explicit path must load; otherwise the
    /// project-local and home locations are tried before falling back to
    /// defaults. Environment overrides are applied last.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_first(&Self::search_paths()).unwrap_or_default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// First config among `paths` that exists and parses. A file that exists
    /// but fails to load is skipped with a warning.
    fn load_first(paths: &[PathBuf]) -> Option<Self> {
        paths.iter().filter(|p| p.is_file()).find_map(|p| match Self::load(p) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!(path = %p.display(), error = %format!("{:#}", err), "ignoring unreadable config");
                None
            }
        })
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("conductor/config.yaml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".agent-conductor").join("config.yaml"));
        }
        paths
    }

    fn apply_env(&mut self) {
        if let Ok(db_path) = std::env::var("CONDUCTOR_DB_PATH") {
            self.store.db_path = PathBuf::from(db_path);
        }

        if let Ok(command) = std::env::var("CONDUCTOR_AGENT_COMMAND") {
            self.agent.command = command;
        }

        if let Ok(hours) = std::env::var("CONDUCTOR_RETENTION_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.store.retention_hours = hours;
            }
        }
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.store.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
