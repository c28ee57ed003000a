//! Runtime configuration
//!
//! Connection credentials come from the environment (`HEARTH_HOST`,
//! `HEARTH_TOKEN`); module loading is configured programmatically or via a
//! deserialized config file section.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the hub host
pub const ENV_HOST: &str = "HEARTH_HOST";

/// Environment variable holding the hub access token
pub const ENV_TOKEN: &str = "HEARTH_TOKEN";

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while assembling the runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable not found
    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hub connection credentials
    pub connection: ConnectionConfig,

    /// Automation module loading
    pub modules: ModulesConfig,
}

/// Credentials consumed by the external connection collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hub host, e.g. "hub.local:8123"
    pub host: String,

    /// Long-lived access token
    pub token: String,
}

impl ConnectionConfig {
    /// Read credentials from the environment
    pub fn from_env() -> ConfigResult<Self> {
        let host = std::env::var(ENV_HOST).map_err(|_| ConfigError::EnvVarNotFound {
            var: ENV_HOST.to_string(),
        })?;
        let token = std::env::var(ENV_TOKEN).map_err(|_| ConfigError::EnvVarNotFound {
            var: ENV_TOKEN.to_string(),
        })?;
        Ok(Self { host, token })
    }
}

fn default_extension() -> String {
    "rs".to_string()
}

fn default_reserved_dirs() -> Vec<String> {
    vec!["lib".to_string()]
}

/// Configuration for automation module discovery and watching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Root directory holding automation module source files
    pub root: PathBuf,

    /// Recognized module source extension (without the dot)
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Reserved library directory names excluded from load/watch.
    /// Each name also excludes its hidden-dot-prefixed form.
    #[serde(default = "default_reserved_dirs")]
    pub reserved_dirs: Vec<String>,
}

impl ModulesConfig {
    /// Configuration for the given modules root with default extension
    /// and reserved directories
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: default_extension(),
            reserved_dirs: default_reserved_dirs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modules_config_defaults() {
        let config = ModulesConfig::new("/srv/automations");
        assert_eq!(config.extension, "rs");
        assert_eq!(config.reserved_dirs, vec!["lib".to_string()]);
    }

    #[test]
    fn test_modules_config_deserializes_with_defaults() {
        let config: ModulesConfig =
            serde_json::from_str(r#"{"root": "/srv/automations"}"#).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/automations"));
        assert_eq!(config.extension, "rs");
    }

    #[test]
    fn test_connection_config_from_env_missing() {
        // Neither variable set in the test environment
        std::env::remove_var(ENV_HOST);
        let err = ConnectionConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound { .. }));
    }
}
