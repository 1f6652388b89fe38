//! Configuration for the VM controller.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::reconciler::ReconcilerConfig;

/// VM controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: String,

    /// Interval between full resyncs of every resource.
    pub resync_interval_secs: u64,

    /// Minimum delay before a failed task is resubmitted.
    pub retry_backoff_secs: u64,

    /// Interval at which in-flight tasks are polled.
    pub task_poll_interval_secs: u64,

    /// Default guest shutdown timeout.
    pub soft_power_off_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/vmctl".to_string(),
            resync_interval_secs: vmctl_reconcile::DEFAULT_RESYNC_INTERVAL.as_secs(),
            retry_backoff_secs: vmctl_reconcile::DEFAULT_RETRY_BACKOFF.as_secs(),
            task_poll_interval_secs: vmctl_reconcile::DEFAULT_TASK_POLL_INTERVAL.as_secs(),
            soft_power_off_timeout_secs: crate::reconciler::DEFAULT_SOFT_POWER_OFF_TIMEOUT
                .as_secs(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let secs = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => {
                    let value: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a whole number of seconds"))?;
                    anyhow::ensure!(value > 0, "{key} must be greater than zero");
                    Ok(value)
                }
                None => Ok(default),
            }
        };

        Ok(Self {
            data_dir: lookup("VMCTL_DATA_DIR").unwrap_or(defaults.data_dir),
            resync_interval_secs: secs(
                "VMCTL_RESYNC_INTERVAL_SECS",
                defaults.resync_interval_secs,
            )?,
            retry_backoff_secs: secs("VMCTL_RETRY_BACKOFF_SECS", defaults.retry_backoff_secs)?,
            task_poll_interval_secs: secs(
                "VMCTL_TASK_POLL_INTERVAL_SECS",
                defaults.task_poll_interval_secs,
            )?,
            soft_power_off_timeout_secs: secs(
                "VMCTL_SOFT_POWER_OFF_TIMEOUT_SECS",
                defaults.soft_power_off_timeout_secs,
            )?,
            log_level: lookup("VMCTL_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Path of the SQLite object store.
    pub fn store_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("vmctl.db")
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            task_poll_interval: Duration::from_secs(self.task_poll_interval_secs),
            soft_power_off_timeout: Duration::from_secs(self.soft_power_off_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.retry_backoff_secs, 60);
        assert_eq!(config.task_poll_interval_secs, 10);
        assert_eq!(config.resync_interval_secs, 300);
        assert_eq!(config.soft_power_off_timeout_secs, 300);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VMCTL_DATA_DIR", "/tmp/vmctl"),
            ("VMCTL_RETRY_BACKOFF_SECS", "15"),
            ("VMCTL_SOFT_POWER_OFF_TIMEOUT_SECS", " 30 "),
        ]))
        .unwrap();

        assert_eq!(config.store_path(), std::path::Path::new("/tmp/vmctl/vmctl.db"));
        let reconciler = config.reconciler();
        assert_eq!(reconciler.retry_backoff, Duration::from_secs(15));
        assert_eq!(reconciler.soft_power_off_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        assert!(Config::from_lookup(lookup(&[("VMCTL_RETRY_BACKOFF_SECS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("VMCTL_TASK_POLL_INTERVAL_SECS", "0")])).is_err());
    }
}
