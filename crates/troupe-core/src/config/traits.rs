//! Core configuration traits for the troupe configuration system

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{Result, TroupeError};

/// Prefix of environment variables recognised by [`TroupeConfig::merge_with_env`]
pub const ENV_PREFIX: &str = "TROUPE_";

/// Core trait for troupe configuration types
///
/// Configurations are layered: defaults, then a file, then environment
/// variables, and are validated last.
pub trait TroupeConfig: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get default configuration values
    fn defaults() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML or JSON file, chosen by extension
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TroupeError::config(format!("Failed to read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("toml") | None => Ok(toml::from_str(&content)?),
            Some(other) => Err(TroupeError::config(format!(
                "Unsupported configuration format: .{other}"
            ))),
        }
    }

    /// Merge with environment variables carrying [`ENV_PREFIX`]
    fn merge_with_env(&mut self) -> Result<()> {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                self.set_from_string(&config_key.to_lowercase(), &value)?;
            }
        }
        Ok(())
    }

    /// Set a configuration value from a string
    ///
    /// Unknown keys are ignored so unrelated variables sharing the prefix do
    /// not break loading.
    fn set_from_string(&mut self, key: &str, value: &str) -> Result<()>;

    /// Validate the configuration
    fn validate(&self) -> Result<()>;

    /// Defaults, then `path` if given, then the environment, then validation
    fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::defaults(),
        };
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }
}

/// Parse a configuration value, naming the key on failure
pub fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| TroupeError::config(format!("Invalid value for {key}: {e}")))
}
