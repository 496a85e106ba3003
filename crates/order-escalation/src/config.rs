//! Application configuration
//!
//! Layered, later wins:
//! 1. built-in defaults
//! 2. TOML file (`--config`, else `./order-escalation.toml` when present)
//! 3. environment (`ESCALATION_*`)
//! 4. command-line flags, applied by the CLI

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use escalation_runtime::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};

use crate::failure::DEFAULT_FAIL_PROBABILITY;

pub const DEFAULT_CONFIG_FILE: &str = "order-escalation.toml";

pub const ENV_STATE_DIR: &str = "ESCALATION_STATE_DIR";
pub const ENV_NAMESPACE: &str = "ESCALATION_NAMESPACE";
pub const ENV_FAIL_PROBABILITY: &str = "ESCALATION_FAIL_PROBABILITY";
pub const ENV_MAX_CONCURRENT: &str = "ESCALATION_MAX_CONCURRENT";

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    /// How often a waiting instance re-checks the store for signals sent
    /// from another process.
    pub signal_poll_interval_ms: u64,
    pub run_schedules: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            poll_interval_ms: 500,
            signal_poll_interval_ms: 1000,
            run_schedules: true,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }
}

/// Simulated latencies of the activities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub lookup_ms: u64,
    pub processing_ms: u64,
    pub payment_delay_ms: u64,
    /// Upper bound of orders started per tick by `simulate-payment`.
    pub max_batch: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            lookup_ms: 2_000,
            processing_ms: 3_000,
            payment_delay_ms: 30_000,
            max_batch: 500,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory holding one subdirectory per namespace.
    pub state_dir: PathBuf,
    pub namespace: String,
    /// Chance that one order lookup attempt fails.
    pub fail_probability: f64,
    pub worker: WorkerConfig,
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".escalation"),
            namespace: DEFAULT_NAMESPACE.to_string(),
            fail_probability: DEFAULT_FAIL_PROBABILITY,
            worker: WorkerConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load file and environment layers.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `ESCALATION_*` values produced by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.namespace = namespace;
        }
        if let Some(raw) = lookup(ENV_FAIL_PROBABILITY) {
            self.fail_probability = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_FAIL_PROBABILITY} must be a number, got {raw:?}"))?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
            self.worker.max_concurrent = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_CONCURRENT} must be an integer, got {raw:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.fail_probability) {
            anyhow::bail!(
                "fail_probability must be between 0 and 1, got {}",
                self.fail_probability
            );
        }
        if self.worker.max_concurrent == 0 {
            anyhow::bail!("worker.max_concurrent must be at least 1");
        }
        if self.namespace.is_empty() {
            anyhow::bail!("namespace must not be empty");
        }
        Ok(())
    }

    /// Directory of the configured namespace.
    pub fn namespace_dir(&self) -> PathBuf {
        self.state_dir.join(&self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.fail_probability, 0.8);
        assert_eq!(config.worker.max_concurrent, 100);
        assert_eq!(config.simulation.max_batch, 500);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            namespace = "payments"
            fail_probability = 0.25

            [worker]
            max_concurrent = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace, "payments");
        assert_eq!(config.fail_probability, 0.25);
        assert_eq!(config.worker.max_concurrent, 8);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.simulation.payment_delay_ms, 30_000);
    }

    #[test]
    fn test_environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            (ENV_NAMESPACE, "staging"),
            (ENV_FAIL_PROBABILITY, "0.5"),
            (ENV_MAX_CONCURRENT, "4"),
            (ENV_STATE_DIR, "/var/lib/escalation"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::from_toml_str("namespace = \"payments\"").unwrap();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.namespace, "staging");
        assert_eq!(config.fail_probability, 0.5);
        assert_eq!(config.worker.max_concurrent, 4);
        assert_eq!(config.namespace_dir(), PathBuf::from("/var/lib/escalation/staging"));
    }

    #[test]
    fn test_bad_environment_value_is_an_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_MAX_CONCURRENT).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_CONCURRENT));
    }

    #[test]
    fn test_validate_rejects_out_of_range_probability() {
        let config = AppConfig {
            fail_probability: 1.5,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
