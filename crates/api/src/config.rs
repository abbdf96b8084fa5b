//! Service configuration
//!
//! Defaults, then an optional TOML file, then `WASTE_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ::config::{Config, Environment, File};
use inference_engine::{ClassLabels, InferenceError, DEFAULT_LABELS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

/// Overrides the configuration file location
pub const CONFIG_PATH_ENV: &str = "WASTE_CLASSIFIER_CONFIG";

/// Configuration file looked up when `WASTE_CLASSIFIER_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "waste-classifier.toml";

const ENV_PREFIX: &str = "WASTE";

/// Configuration errors (fatal at startup)
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Source(#[from] ::config::ConfigError),
    #[error("Invalid bind address '{0}'")]
    BindAddr(String),
    #[error("Invalid log level '{0}'")]
    LogLevel(String),
    #[error("Invalid label set: {0}")]
    Labels(#[from] InferenceError),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listen address
    pub bind_addr: String,
    /// Checkpoint read once at startup
    pub model_path: PathBuf,
    /// Upload body limit for `/predict`
    pub max_upload_bytes: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Class labels in training order
    pub labels: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            model_path: PathBuf::from("best_waste_model.pth"),
            max_upload_bytes: 32 * 1024 * 1024,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Load from the config file and process environment
    pub fn load() -> Result<Self, SettingsError> {
        let file =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_sources(&file, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(file: &str, env: Environment) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                env.try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("labels"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check every derived value parses
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.socket_addr()?;
        self.level()?;
        self.class_labels()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, SettingsError> {
        self.bind_addr
            .parse()
            .map_err(|_| SettingsError::BindAddr(self.bind_addr.clone()))
    }

    pub fn level(&self) -> Result<Level, SettingsError> {
        Level::from_str(&self.log_level)
            .map_err(|_| SettingsError::LogLevel(self.log_level.clone()))
    }

    pub fn class_labels(&self) -> Result<ClassLabels, SettingsError> {
        Ok(ClassLabels::new(self.labels.clone())?)
    }
}
