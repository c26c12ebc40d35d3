//! Configuration for shipyard.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHIPYARD_HOME)
//! 2. Config file (.shipyard/config.yaml)
//! 3. Defaults (~/.shipyard)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shipyard/config.yaml
//! - Paths in config file are relative to the .shipyard/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default wall-clock budget of one stage attempt
pub const DEFAULT_STAGE_TIMEOUT_SECONDS: u64 = 3600;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub defaults: Option<DefaultsConfig>,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .shipyard/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running stages (0 = unlimited)
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    pub stage_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub shell: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to shipyard home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Upper bound on concurrently running stages (0 = unlimited)
    pub max_parallel: usize,
    /// Stage timeout used when neither stage nor pipeline sets one
    pub stage_timeout_seconds: u64,
    /// Shell used by the shell executor
    pub shell: String,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".shipyard").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge an optional config file, the SHIPYARD_HOME override and defaults
fn resolve_config(
    config_file: Option<PathBuf>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let mut resolved = ResolvedConfig {
        home: default_home,
        config_file: None,
        max_parallel: 0,
        stage_timeout_seconds: DEFAULT_STAGE_TIMEOUT_SECONDS,
        shell: "sh".to_string(),
    };

    if let Some(config_path) = config_file {
        let config = load_config_file(&config_path)?;

        if let Some(ref home_path) = config.paths.home {
            // home is relative to .shipyard/ directory
            let shipyard_dir = config_path.parent().unwrap_or(Path::new("."));
            resolved.home = resolve_path(shipyard_dir, home_path);
        }
        if let Some(max_parallel) = config.scheduler.and_then(|s| s.max_parallel) {
            resolved.max_parallel = max_parallel;
        }
        if let Some(timeout) = config.defaults.and_then(|d| d.stage_timeout_seconds) {
            resolved.stage_timeout_seconds = timeout;
        }
        if let Some(shell) = config.executor.and_then(|e| e.shell) {
            resolved.shell = shell;
        }
        resolved.config_file = Some(config_path);
    }

    if let Some(home) = env_home {
        resolved.home = home;
    }

    Ok(resolved)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".shipyard");

    let config_file = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_config_file(&cwd));
    let env_home = std::env::var_os("SHIPYARD_HOME").map(PathBuf::from);

    resolve_config(config_file, env_home, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
