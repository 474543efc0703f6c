//! Application configuration management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Polling engine settings
    pub polling: PollingConfig,

    /// HTTP transport settings
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory override (store + logs live here)
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Period of the health audit loop, in seconds
    pub health_check_secs: u64,

    /// A task is unhealthy once now - last_poll >= interval * stale_multiplier
    pub stale_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds for all provider calls
    pub timeout_secs: u64,

    /// User agent string
    pub user_agent: String,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 30,
            stale_multiplier: 2.5,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: format!("oasthub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.display().to_string(),
                    source: e,
                })?;

            let config: Config =
                toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Get default configuration file path
    fn default_config_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("io", "oasthub", "oasthub")
            .ok_or(ConfigError::UnknownDirectory("config"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Resolve the data directory, honoring the configured override
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.general.data_dir {
            return Ok(dir.clone());
        }

        let dirs = directories::ProjectDirs::from("io", "oasthub", "oasthub")
            .ok_or(ConfigError::UnknownDirectory("data"))?;

        Ok(dirs.data_dir().to_path_buf())
    }

    /// Path of the persisted store document
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("store.json"))
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.polling.health_check_secs, 30);
        assert_eq!(config.polling.stale_multiplier, 2.5);
        assert_eq!(config.http.timeout_secs, 10);
        assert!(config.http.user_agent.starts_with("oasthub/"));
    }

    #[test]
    fn test_partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [http]
            timeout_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.http.timeout_secs, 3);
        assert_eq!(config.polling.health_check_secs, 30);
    }

    #[test]
    fn test_data_dir_override_wins() {
        let mut config = Config::default();
        config.general.data_dir = Some(PathBuf::from("/tmp/oasthub-test"));
        assert_eq!(
            config.store_path().unwrap(),
            PathBuf::from("/tmp/oasthub-test/store.json")
        );
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[http\ntimeout_secs = 3").unwrap();

        let err = Config::load(path.to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
