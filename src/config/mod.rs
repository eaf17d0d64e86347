//! Controller configuration
//!
//! Loaded from a YAML (or JSON) file; every field has a default so an empty
//! document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::memory::ClusterSeed;
use crate::cluster::retry::RetryPolicy;
use crate::engine::EngineSettings;
use crate::ports::{AllocationStrategy, PortRange};
use crate::reconciler::ReconcilerConfig;

/// Default config file location: ~/.cacheplane/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cacheplane")
        .join("config.yaml")
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(text.as_ref()).as_ref())
}

/// Errors for configuration and seed files
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid config value for '{0}': {1}")]
    InvalidValue(&'static str, String),
}

/// Conflict retry settings as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(rename = "initialBackoffMs")]
    pub initial_backoff_ms: u64,

    #[serde(rename = "maxBackoffMs")]
    pub max_backoff_ms: u64,

    pub multiplier: f64,

    #[serde(rename = "maxAttempts")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl From<&RetryPolicy> for RetrySettings {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
            max_attempts: policy.max_attempts,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Controller-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Range host-network ports are allocated from
    #[serde(rename = "portRange")]
    pub port_range: PortRange,

    #[serde(rename = "portAllocationStrategy")]
    pub port_allocation_strategy: AllocationStrategy,

    /// Fixed seed for the random strategy; unset draws one at startup
    #[serde(rename = "portAllocationSeed", skip_serializing_if = "Option::is_none")]
    pub port_allocation_seed: Option<u64>,

    /// Failed cache cleanups tolerated before shutdown proceeds
    #[serde(rename = "gracefulShutdownLimits")]
    pub graceful_shutdown_limits: u32,

    #[serde(rename = "reconcileIntervalSecs")]
    pub reconcile_interval_secs: u64,

    /// Timeout for exec-style cache operations
    #[serde(rename = "execTimeoutSecs")]
    pub exec_timeout_secs: u64,

    /// Node label writes (unbounded attempts by default)
    #[serde(rename = "labelRetry")]
    pub label_retry: RetrySettings,

    /// Runtime and dataset status writes
    #[serde(rename = "statusRetry")]
    pub status_retry: RetrySettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            port_allocation_strategy: AllocationStrategy::default(),
            port_allocation_seed: None,
            graceful_shutdown_limits: 5,
            reconcile_interval_secs: 10,
            exec_timeout_secs: 1800,
            label_retry: RetrySettings::from(&RetryPolicy::unbounded()),
            status_retry: RetrySettings::from(&RetryPolicy::bounded(5)),
        }
    }
}

impl ControllerConfig {
    /// Parse a configuration document
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = if content.trim().is_empty() {
            ControllerConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, retry) in [
            ("labelRetry", &self.label_retry),
            ("statusRetry", &self.status_retry),
        ] {
            if retry.multiplier < 1.0 {
                return Err(ConfigError::InvalidValue(
                    field,
                    format!("multiplier {} is below 1.0", retry.multiplier),
                ));
            }
            if retry.max_attempts == Some(0) {
                return Err(ConfigError::InvalidValue(field, "maxAttempts is 0".into()));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            graceful_shutdown_limits: self.graceful_shutdown_limits,
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            status_retry: RetryPolicy::from(&self.status_retry),
        }
    }

    pub fn label_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.label_retry)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            reconcile_interval_secs: self.reconcile_interval_secs,
        }
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure parsing
// ============================================================================

/// Load the controller configuration from disk
pub fn load_config_file(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let content = std::fs::read_to_string(expand_path(path))?;
    ControllerConfig::parse(&content)
}

/// Load a cluster seed (nodes, datasets, runtimes) from disk
pub fn load_seed_file(path: &Path) -> Result<ClusterSeed, ConfigError> {
    let content = std::fs::read_to_string(expand_path(path))?;
    Ok(serde_yaml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ControllerConfig::parse("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.port_range, PortRange::new(20000, 26000).unwrap());
        assert_eq!(config.engine_settings().graceful_shutdown_limits, 5);
        assert_eq!(config.label_retry_policy().max_attempts, None);
        assert_eq!(config.engine_settings().status_retry.max_attempts, Some(5));
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file(
            r#"
portRange: "14000-14003"
gracefulShutdownLimits: 2
execTimeoutSecs: 60
statusRetry:
  initialBackoffMs: 5
  maxBackoffMs: 50
  multiplier: 2.0
  maxAttempts: 3
"#,
        );
        let config = load_config_file(file.path()).unwrap();

        assert_eq!(config.port_range, PortRange::new(14000, 14003).unwrap());
        assert_eq!(config.reconcile_interval_secs, 10);
        let settings = config.engine_settings();
        assert_eq!(settings.exec_timeout, Duration::from_secs(60));
        assert_eq!(settings.status_retry.max_attempts, Some(3));
        assert_eq!(settings.status_retry.initial_backoff, Duration::from_millis(5));
    }

    #[test]
    fn test_random_strategy_config() {
        let config =
            ControllerConfig::parse("portAllocationStrategy: random\nportAllocationSeed: 11\n")
                .unwrap();
        assert_eq!(config.port_allocation_strategy, AllocationStrategy::Random);
        assert_eq!(config.port_allocation_seed, Some(11));

        let result = ControllerConfig::parse("portAllocationStrategy: roundrobin");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_json_config_is_accepted() {
        let config = ControllerConfig::parse(r#"{"portRange": "30000-30010"}"#).unwrap();
        assert_eq!(config.port_range.len(), 11);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let result = ControllerConfig::parse("portRange: \"26000-20000\"");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = ControllerConfig::parse(
            "labelRetry:\n  initialBackoffMs: 1\n  maxBackoffMs: 1\n  multiplier: 1.0\n  maxAttempts: 0\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue("labelRetry", _))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_seed_file() {
        let file = create_temp_file(
            r#"
nodes:
  - metadata:
      name: n1
datasets:
  - metadata:
      name: hbase
      namespace: default
    spec:
      placement: Exclusive
runtimes:
  - metadata:
      name: hbase
      namespace: default
    spec:
      engine: alluxio
      worker:
        replicas: 2
"#,
        );
        let seed = load_seed_file(file.path()).unwrap();
        assert_eq!(seed.nodes.len(), 1);
        assert!(seed.datasets[0].is_exclusive());
        assert_eq!(seed.runtimes[0].spec.worker.replicas, 2);
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with(".cacheplane/config.yaml"));
    }
}
