//! Dump Controller Configuration
//!
//! Timing, retry, and convention settings for the `DumpRequest` controller.
//! Loaded from a mounted YAML file; every field has a default so a partial
//! file (or none at all) still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Dump capture and detection settings
    #[serde(default)]
    pub dump: DumpConfig,

    /// Status write settings
    #[serde(default)]
    pub status: StatusConfig,

    /// Backoff for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Controller runtime settings
    #[serde(default)]
    pub controller: RuntimeConfig,
}

/// Dump capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DumpConfig {
    /// Delay between archive detection attempts
    #[serde(default = "default_poll_interval", rename = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,

    /// Overall window for the archive to appear after Started
    #[serde(default = "default_detection_timeout", rename = "detectionTimeoutSeconds")]
    pub detection_timeout_seconds: u64,

    /// Upper bound for a single remote command
    #[serde(default = "default_exec_timeout", rename = "execTimeoutSeconds")]
    pub exec_timeout_seconds: u64,

    /// Serviceability directory inside the target container
    #[serde(default = "default_serviceability_root", rename = "serviceabilityRoot")]
    pub serviceability_root: String,

    /// Container to exec into when the request does not name one
    #[serde(default = "default_container_name", rename = "containerName")]
    pub container_name: String,

    /// Server launcher used to trigger the dump
    #[serde(default = "default_server_command", rename = "serverCommand")]
    pub server_command: String,

    /// List archive entries after detection and warn about missing kinds
    #[serde(default, rename = "verifyArchive")]
    pub verify_archive: bool,
}

/// Status write configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusConfig {
    /// Attempts per status write before a conflict is surfaced
    #[serde(default = "default_max_conflict_retries", rename = "maxConflictRetries")]
    pub max_conflict_retries: u32,
}

/// Backoff configuration for transient failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff", rename = "initialBackoffSeconds")]
    pub initial_backoff_seconds: u64,

    #[serde(default = "default_max_backoff", rename = "maxBackoffSeconds")]
    pub max_backoff_seconds: u64,
}

/// Controller runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Maximum number of resources reconciled in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    /// Restrict the watch to one namespace (all namespaces when unset)
    #[serde(default, rename = "watchNamespace")]
    pub watch_namespace: Option<String>,
}

fn default_poll_interval() -> u64 {
    2
}

fn default_detection_timeout() -> u64 {
    300
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_serviceability_root() -> String {
    "serviceability".to_string()
}

fn default_container_name() -> String {
    "app".to_string()
}

fn default_server_command() -> String {
    "server".to_string()
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    300
}

fn default_concurrency() -> u16 {
    4
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            detection_timeout_seconds: default_detection_timeout(),
            exec_timeout_seconds: default_exec_timeout(),
            serviceability_root: default_serviceability_root(),
            container_name: default_container_name(),
            server_command: default_server_command(),
            verify_archive: false,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_seconds: default_initial_backoff(),
            max_backoff_seconds: default_max_backoff(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            watch_namespace: None,
        }
    }
}

impl DumpConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    #[must_use]
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(self.detection_timeout_seconds)
    }

    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds)
    }
}

impl RetryConfig {
    /// Exponential backoff for the given number of consecutive failures (1-based)
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let secs = self
            .initial_backoff_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_seconds);
        Duration::from_secs(secs)
    }
}

impl ControllerConfig {
    /// Validate that configuration values are usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.dump.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("dump.pollIntervalSeconds must be greater than zero"));
        }
        if self.dump.detection_timeout_seconds < self.dump.poll_interval_seconds {
            return Err(anyhow::anyhow!(
                "dump.detectionTimeoutSeconds ({}) must not be shorter than dump.pollIntervalSeconds ({})",
                self.dump.detection_timeout_seconds,
                self.dump.poll_interval_seconds
            ));
        }
        if self.dump.exec_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("dump.execTimeoutSeconds must be greater than zero"));
        }
        if self.dump.serviceability_root.trim().is_empty() {
            return Err(anyhow::anyhow!("dump.serviceabilityRoot must not be empty"));
        }
        if self.dump.container_name.trim().is_empty() {
            return Err(anyhow::anyhow!("dump.containerName must not be empty"));
        }
        if self.status.max_conflict_retries == 0 {
            return Err(anyhow::anyhow!("status.maxConflictRetries must be at least 1"));
        }
        if self.retry.initial_backoff_seconds == 0
            || self.retry.max_backoff_seconds < self.retry.initial_backoff_seconds
        {
            return Err(anyhow::anyhow!(
                "retry.initialBackoffSeconds must be positive and not exceed retry.maxBackoffSeconds"
            ));
        }
        if self.controller.concurrency == 0 {
            return Err(anyhow::anyhow!("controller.concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Apply environment overrides on top of the file configuration
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(namespace) = std::env::var("WATCH_NAMESPACE") {
            let namespace = namespace.trim();
            self.controller.watch_namespace = if namespace.is_empty() {
                None
            } else {
                Some(namespace.to_string())
            };
        }
        self
    }
}
