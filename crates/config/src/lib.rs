//! Configuration management for the voice call client
//!
//! Supports loading configuration from:
//! - YAML/TOML files (`config/default`, `config/{env}`)
//! - Environment variables (VOICE_CALL__ prefix, `__` section separator)

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, load_settings_from, CallConfig, FallbackConfig, MediaConfig,
    ObservabilityConfig, RuntimeEnvironment, Settings, SignalingConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
