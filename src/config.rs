use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::resilience::{CircuitBreakerSettings, RetryPolicies};
use crate::sandbox::{EnvironmentSettings, GatekeeperSettings, ManagerOptions, MonitorSettings};

// ---------------------------------------------------------------------------
// Log config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// text | compact | json | pretty
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Defaults to `~/.isolab/logs`
    pub dir: Option<String>,
    #[serde(default)]
    pub file_output: bool,
    /// local | utc | rfc3339 | custom
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    pub custom_timestamp_format: Option<String>,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default)]
    pub show_thread_ids: bool,
    #[serde(default)]
    pub show_file: bool,
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_timestamp_format() -> String {
    "local".into()
}
fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            file_output: false,
            timestamp_format: default_timestamp_format(),
            custom_timestamp_format: None,
            show_target: true,
            show_thread_ids: false,
            show_file: false,
            module_levels: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub environment: EnvironmentSettings,
    #[serde(default)]
    pub retry: RetryPolicies,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub gatekeeper: GatekeeperSettings,
    /// Directory searched for `<name>.json` workflows. Defaults to
    /// `~/.isolab/workflows`.
    pub workflows_dir: Option<String>,
}

impl Config {
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            environment: self.environment.clone(),
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            monitor: self.monitor.clone(),
            gatekeeper: self.gatekeeper.clone(),
        }
    }

    /// Sanity checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !self.environment.mount_point.starts_with('/') {
            anyhow::bail!(
                "environment.mountPoint must be absolute, got '{}'",
                self.environment.mount_point
            );
        }
        for (name, policy) in [
            ("containerCreation", &self.retry.container_creation),
            ("resourceAllocation", &self.retry.resource_allocation),
            ("networkOperation", &self.retry.network_operation),
            ("analysisExecution", &self.retry.analysis_execution),
        ] {
            if policy.max_attempts == 0 {
                anyhow::bail!("retry.{}.maxAttempts must be at least 1", name);
            }
            if policy.backoff_multiplier < 1.0 {
                anyhow::bail!("retry.{}.backoffMultiplier must be >= 1.0", name);
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuitBreaker.failureThreshold must be at least 1");
        }
        if self.gatekeeper.max_download_bytes == 0 {
            anyhow::bail!("gatekeeper.maxDownloadBytes must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".isolab")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn expand_home(raw: &str) -> PathBuf {
    if raw.starts_with('~') {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(raw.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(raw)
    }
}

pub fn log_dir_path(cfg: &Config) -> PathBuf {
    cfg.log
        .dir
        .as_deref()
        .map(expand_home)
        .unwrap_or_else(|| config_dir().join("logs"))
}

pub fn workflows_dir_path(cfg: &Config) -> PathBuf {
    cfg.workflows_dir
        .as_deref()
        .map(expand_home)
        .unwrap_or_else(|| config_dir().join("workflows"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        let cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?;
        cfg.validate()
            .with_context(|| format!("validating config from {}", p.display()))?;
        Ok(cfg)
    } else {
        Ok(Config::default())
    }
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(&p, json)?;
    Ok(())
}
