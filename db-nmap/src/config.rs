use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use crate::store::merge::MergePolicy;
use crate::store::supervisor::RetryPolicy;

pub const CONFIG_ENV_VAR: &str = "DB_NMAP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/db-nmap/config.toml";
pub const WORKSPACE_ENV_VAR: &str = "MSF_WORKSPACE";
pub const MULTIPLE_HOSTNAMES_ENV_VAR: &str = "DB_NMAP_ENABLE_MULTIPLE_HOSTNAMES";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Bytes buffered between the tee and the decoder
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_multiple_hostnames")]
    pub multiple_hostnames: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/db-nmap/hosts.db")
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_binary() -> String {
    "nmap".to_string()
}

fn default_pipe_capacity() -> usize {
    64 * 1024
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_delay() -> u64 {
    1000
}

fn default_deadline() -> u64 {
    300
}

fn default_multiple_hostnames() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: default_workspace(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            pipe_capacity: default_pipe_capacity(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            deadline_secs: default_deadline(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            multiple_hostnames: default_multiple_hostnames(),
        }
    }
}

impl ReconnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            deadline: Some(Duration::from_secs(self.deadline_secs)),
        }
    }
}

impl MergeConfig {
    pub fn policy(&self) -> MergePolicy {
        MergePolicy {
            multiple_hostnames: self.multiple_hostnames,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Resolve the config file from `DB_NMAP_CONFIG`, then apply environment overrides.
    ///
    /// A missing file at the default location yields the built-in defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            Err(_) => {
                tracing::debug!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workspace) = lookup(WORKSPACE_ENV_VAR).filter(|w| !w.is_empty()) {
            self.workspace.name = workspace;
        }

        if let Some(enabled) = lookup(MULTIPLE_HOSTNAMES_ENV_VAR).as_deref().and_then(parse_bool) {
            self.merge.multiple_hostnames = enabled;
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}
