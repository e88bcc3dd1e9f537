//! Engine configuration
//!
//! Deserialized from a toml file; every field has a default so an empty file
//! (or no file at all) yields a working configuration.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    time::Duration,
};

use postbox_delivery::{LogLevel, RetryPolicy};
use serde::Deserialize;
use thiserror::Error;

mod defaults {
    pub const fn processes() -> usize {
        1
    }

    pub const fn batch_size() -> usize {
        100
    }

    pub const fn interval_secs() -> u64 {
        30
    }

    pub const fn lock_timeout_secs() -> u64 {
        60
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How the periodic dispatch loop selects and fans out each batch.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent worker tasks per dispatch run.
    #[serde(default = "defaults::processes")]
    pub processes: usize,

    /// Upper bound on messages selected per run.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Seconds between dispatch runs.
    #[serde(default = "defaults::interval_secs")]
    pub interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            processes: defaults::processes(),
            batch_size: defaults::batch_size(),
            interval_secs: defaults::interval_secs(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Distributed lock tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lease lifetime and cooperative timeout for the critical section.
    #[serde(default = "defaults::lock_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::lock_timeout_secs(),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub lock: LockConfig,

    /// How much attempt logging to persist.
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Config {
    /// Load configuration from a toml file.
    ///
    /// # Errors
    ///
    /// If the file doesn't exist, is not readable, or is not valid toml.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;

        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.dispatch.processes, 1);
        assert_eq!(config.dispatch.batch_size, 100);
        assert_eq!(config.dispatch.interval_secs, 30);
        assert_eq!(config.lock.timeout_secs, 60);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.log_level, LogLevel::All);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            log_level = "failures_only"

            [dispatch]
            processes = 4

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch.processes, 4);
        assert_eq!(config.dispatch.batch_size, 100);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.log_level, LogLevel::FailuresOnly);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lock]\ntimeout_secs = 120").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.lock.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            Config::from_file("/nonexistent/postbox.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
