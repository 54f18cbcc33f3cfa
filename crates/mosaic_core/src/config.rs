//! Kernel configuration.
//!
//! # Responsibility
//! - Deserialize kernel settings from JSON.
//! - Normalize and validate them before the kernel starts.

use crate::logging::{default_log_level, normalize_level, normalize_log_dir, LoggingError};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

const DEFAULT_KERNEL_NAME: &str = "mosaic";

/// Logging section of [`KernelConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            log_dir: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>, log_dir: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            log_dir: log_dir.into(),
        }
    }
}

/// Settings accepted by [`crate::Kernel::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Display name used in kernel log lines.
    pub name: String,
    /// Logging is left untouched when absent.
    pub logging: Option<LoggingConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_KERNEL_NAME.to_string(),
            logging: None,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the normalized config, or the first invalid setting.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        self.name = name.to_string();

        if let Some(logging) = self.logging.as_mut() {
            logging.level = normalize_level(&logging.level)?.to_string();
            logging.log_dir = normalize_log_dir(&logging.log_dir)?
                .to_string_lossy()
                .into_owned();
        }
        Ok(self)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    EmptyName,
    Logging(LoggingError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "invalid kernel config: {message}"),
            Self::EmptyName => write!(f, "kernel name cannot be empty"),
            Self::Logging(err) => write!(f, "invalid logging config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Logging(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LoggingError> for ConfigError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, KernelConfig};
    use crate::logging::LoggingError;

    #[test]
    fn empty_document_uses_defaults() {
        let config = KernelConfig::from_json_str("{}").expect("parse");
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.name, "mosaic");
        assert!(config.logging.is_none());
    }

    #[test]
    fn validate_normalizes_logging_level() {
        let config = KernelConfig::from_json_str(
            r#"{"name":" shell ","logging":{"level":"WARNING","log_dir":"/tmp/mosaic-logs"}}"#,
        )
        .expect("parse")
        .validate()
        .expect("valid");
        assert_eq!(config.name, "shell");
        let logging = config.logging.expect("logging section");
        assert_eq!(logging.level, "warn");
        assert_eq!(logging.log_dir, "/tmp/mosaic-logs");
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let relative = KernelConfig::from_json_str(r#"{"logging":{"log_dir":"logs"}}"#)
            .expect("parse")
            .validate()
            .expect_err("relative log dir");
        assert!(matches!(
            relative,
            ConfigError::Logging(LoggingError::RelativeLogDir(_))
        ));

        let name = KernelConfig::from_json_str(r#"{"name":"  "}"#)
            .expect("parse")
            .validate()
            .expect_err("blank name");
        assert_eq!(name, ConfigError::EmptyName);

        assert!(matches!(
            KernelConfig::from_json_str("{\"name\": 3}"),
            Err(ConfigError::Parse(_))
        ));
    }
}
