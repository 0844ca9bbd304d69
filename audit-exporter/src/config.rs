//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: AUDIT_EXPORTER_, nested keys split on `__`)
//! 2. An explicit file passed on the command line
//! 3. Current working directory: ./config.toml
//! 4. XDG config directory: ~/.config/audit-exporter/config.toml
//! 5. System directory: /etc/audit-exporter/config.toml
//! 6. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

const ENV_PREFIX: &str = "AUDIT_EXPORTER_";
const APP_DIR: &str = "audit-exporter";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Kernel audit subsystem configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Ingestion pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port the HTTP exporter listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level or tracing filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Kernel audit subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Maximum records per second the kernel may emit
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Maximum queued-but-undelivered records in the kernel
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: u32,

    /// Path of the `auditctl` binary used for provisioning
    #[serde(default = "default_auditctl")]
    pub auditctl: PathBuf,

    /// Audit record stream to read (the audit daemon's log)
    #[serde(default = "default_record_path")]
    pub record_path: PathBuf,

    /// Keep reading as the record stream grows
    #[serde(default = "default_true")]
    pub follow: bool,

    /// Poll interval while waiting for new records in follow mode (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            backlog_limit: default_backlog_limit(),
            auditctl: default_auditctl(),
            record_path: default_record_path(),
            follow: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AuditConfig {
    /// Get the follow-mode poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What the handoff does when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// The producer waits until the consumer makes room
    #[default]
    Block,
    /// The incoming message is discarded
    DropNewest,
    /// The oldest queued message is discarded to make room
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropNewest => write!(f, "drop-newest"),
            Self::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum delay between two processed messages (milliseconds)
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,

    /// Handoff queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Handoff overflow policy
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Upper bound on `RuleStat` series; unbounded when absent
    #[serde(default)]
    pub max_series: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pacing_interval_ms: default_pacing_interval_ms(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            max_series: None,
        }
    }
}

impl PipelineConfig {
    /// Get the pacing interval as Duration
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }
}

// Default value functions
fn default_port() -> u16 {
    9099
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    1000
}

fn default_backlog_limit() -> u32 {
    250
}

fn default_auditctl() -> PathBuf {
    PathBuf::from("auditctl")
}

fn default_record_path() -> PathBuf {
    PathBuf::from("/var/log/audit/audit.log")
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_pacing_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches the system, XDG and working directories; `explicit` is merged
    /// above all of them. Environment variables override everything.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_paths = Self::find_config_paths();

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so that later files override earlier ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing the search path
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Config file paths in priority order (highest first)
    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_DIR);
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc").join(APP_DIR).join("config.toml"));

        paths
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: APP_DIR.to_string(),
                port: default_port(),
                log_level: default_log_level(),
            },
            audit: AuditConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}
