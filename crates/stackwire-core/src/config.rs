//! Deploy configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object (or no file at all) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings shared by planning, the executor and the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Prepended to every derived physical name
    pub prefix: String,
    pub partition: String,
    pub region: String,
    /// 12-digit account id used in ARNs
    pub account: String,
    /// Per-invocation limit for custom-resource handlers (ms)
    pub handler_timeout_ms: u64,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Base delay for exponential backoff (ms)
    pub backoff_base_ms: u64,
    /// Upper bound on resources applied at once within a level
    pub max_concurrent: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            prefix: "stackwire-".to_string(),
            partition: "aws".to_string(),
            region: "us-east-1".to_string(),
            account: "000000000000".to_string(),
            handler_timeout_ms: 300_000,
            max_retries: 2,
            backoff_base_ms: 500,
            max_concurrent: 4,
        }
    }
}

impl DeployConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handler_timeout_ms must be positive".to_string(),
            ));
        }
        if self.account.len() != 12 || !self.account.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "account '{}' must be 12 digits",
                self.account
            )));
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = DeployConfig::default();
        config.validate().unwrap();
        assert_eq!(config.handler_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"region": "eu-west-1", "max_retries": 0}}"#).unwrap();
        let config = DeployConfig::from_file(file.path()).unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.prefix, "stackwire-");
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = DeployConfig {
            max_concurrent: 0,
            ..DeployConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_account_rejected() {
        let config = DeployConfig {
            account: "12ab".to_string(),
            ..DeployConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
