//! Executor configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DEFAULT_MUTATION_TIMEOUT, DEFAULT_VERIFY_TIMEOUT};

/// Errors loading an executor configuration file.
#[derive(Debug, Error)]
pub enum ExecutorConfigError {
    /// The file could not be read.
    #[error("failed to read executor config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse executor config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables of an executor, loadable from a TOML file.
///
/// Durations use humantime strings (`"5s"`, `"950ms"`). A zero timeout
/// means no deadline for that endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deadline for verify requests; defaults to 5000 ms when absent.
    #[serde(default, with = "humantime_serde")]
    pub verification_request_timeout: Option<Duration>,

    /// Deadline for mutation requests; defaults to 2000 ms when absent.
    #[serde(default, with = "humantime_serde")]
    pub mutation_request_timeout: Option<Duration>,

    /// Name of the store the mutation endpoint resolves digests through.
    #[serde(default)]
    pub mutation_store: Option<String>,
}

impl ExecutorConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorConfigError`] when the file cannot be read or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExecutorConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// The verify deadline, applying the default when unset.
    #[must_use]
    pub fn verify_request_timeout(&self) -> Duration {
        self.verification_request_timeout
            .unwrap_or(DEFAULT_VERIFY_TIMEOUT)
    }

    /// The mutation deadline, applying the default when unset.
    #[must_use]
    pub fn mutation_request_timeout(&self) -> Duration {
        self.mutation_request_timeout
            .unwrap_or(DEFAULT_MUTATION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = ExecutorConfig::default();
        assert_eq!(config.verify_request_timeout(), DEFAULT_VERIFY_TIMEOUT);
        assert_eq!(config.mutation_request_timeout(), DEFAULT_MUTATION_TIMEOUT);
        assert!(config.mutation_store.is_none());
    }

    #[test]
    fn parses_humantime_durations() {
        let config: ExecutorConfig = toml::from_str(
            r#"
            verification_request_timeout = "3s"
            mutation_request_timeout = "950ms"
            mutation_store = "oras"
            "#,
        )
        .unwrap();
        assert_eq!(config.verify_request_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.mutation_request_timeout(),
            Duration::from_millis(950)
        );
        assert_eq!(config.mutation_store.as_deref(), Some("oras"));
    }

    #[test]
    fn zero_timeout_round_trips() {
        let config: ExecutorConfig = toml::from_str(
            r#"
            verification_request_timeout = "0s"
            "#,
        )
        .unwrap();
        assert!(config.verify_request_timeout().is_zero());
    }
}
