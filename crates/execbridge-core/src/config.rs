//! Configuration resolution for execbridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/execbridge/settings.json)
//! 3. Project config (.execbridge/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Complete execbridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub sessions: SessionDefaults,
}

/// Process runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Shell used to interpret the command line (`<shell> -c "<cmd> <args>"`).
    pub shell: PathBuf,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Defaults applied to new sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    /// Execution timeout in seconds. `None` or negative means unbounded.
    pub timeout_secs: Option<i64>,
    pub output_split: OutputSplit,
    /// Inbound event carrying remote stdin. Empty disables remote input.
    pub input_event: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            output_split: OutputSplit::default(),
            input_event: "input".to_string(),
        }
    }
}

/// How raw process output is chunked before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputSplit {
    /// One token per line, delimiter stripped.
    #[default]
    LineDelimited,
    /// Whatever bytes are available, without waiting for a delimiter.
    RawBlock,
}

impl FromStr for OutputSplit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "line" | "lines" | "line-delimited" => Ok(Self::LineDelimited),
            "raw" | "block" | "raw-block" => Ok(Self::RawBlock),
            other => Err(Error::Config(format!("Unknown output split mode: {other}"))),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".execbridge").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Load a single settings file, layered over built-in defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".execbridge").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/execbridge/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("execbridge").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.runner = overlay.runner;

    if overlay.sessions.timeout_secs.is_some() {
        base.sessions.timeout_secs = overlay.sessions.timeout_secs;
    }
    base.sessions.output_split = overlay.sessions.output_split;
    base.sessions.input_event = overlay.sessions.input_event;
}

/// Apply `EXECBRIDGE_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("EXECBRIDGE_SHELL") {
        config.runner.shell = PathBuf::from(val);
    }
    if let Some(val) = lookup("EXECBRIDGE_LOG_LEVEL") {
        config.runner.log_level = val;
    }
    if let Some(val) = lookup("EXECBRIDGE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.sessions.timeout_secs = Some(n);
    }
    if let Some(val) = lookup("EXECBRIDGE_OUTPUT_SPLIT") {
        match val.parse() {
            Ok(split) => config.sessions.output_split = split,
            Err(e) => tracing::warn!(error = %e, "Ignoring EXECBRIDGE_OUTPUT_SPLIT"),
        }
    }
    if let Some(val) = lookup("EXECBRIDGE_INPUT_EVENT") {
        config.sessions.input_event = val;
    }
}
