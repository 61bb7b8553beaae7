//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use voice_call_core::{AudioConstraints, IceServer};

use crate::constants::{call, fallback, ice, signaling};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - plain ws:// signaling allowed
    #[default]
    Development,
    /// Staging mode
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Runtime environment (development, staging, production)
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Signaling backend connection
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Call setup, timeouts and recovery budget
    #[serde(default)]
    pub call: CallConfig,

    /// Local media and ICE servers
    #[serde(default)]
    pub media: MediaConfig,

    /// Chunked relay fallback timing
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_signaling()?;
        self.validate_call()?;
        self.validate_media()?;
        self.validate_fallback()?;
        Ok(())
    }

    fn validate_signaling(&self) -> Result<(), ConfigError> {
        let signaling = &self.signaling;

        if !(signaling.url.starts_with("ws://") || signaling.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                field: "signaling.url".to_string(),
                message: format!("Expected a ws:// or wss:// URL, got '{}'", signaling.url),
            });
        }

        if self.environment.is_production() && !signaling.url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue {
                field: "signaling.url".to_string(),
                message: "Production requires a wss:// signaling URL".to_string(),
            });
        }

        if signaling.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signaling.max_reconnect_attempts".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if signaling.reconnect_attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signaling.reconnect_attempt_timeout_ms".to_string(),
                message: "Must be at least 1ms".to_string(),
            });
        }

        if signaling.reconnect_initial_backoff_ms > signaling.reconnect_max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "signaling.reconnect_initial_backoff_ms".to_string(),
                message: format!(
                    "Cannot exceed reconnect_max_backoff_ms ({})",
                    signaling.reconnect_max_backoff_ms
                ),
            });
        }

        if signaling.outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signaling.outbound_buffer".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn validate_call(&self) -> Result<(), ConfigError> {
        let call = &self.call;

        if call.max_connection_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call.max_connection_retries".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if call.connection_timeout_ms == 0 || call.ring_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call.connection_timeout_ms".to_string(),
                message: "Connection and ring timeouts must be at least 1ms".to_string(),
            });
        }

        if call.ice_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call.ice_poll_interval_ms".to_string(),
                message: "Must be at least 1ms".to_string(),
            });
        }

        if call.ice_poll_interval_ms >= call.ice_gathering_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "call.ice_poll_interval_ms".to_string(),
                message: format!(
                    "Must be shorter than ice_gathering_timeout_ms ({})",
                    call.ice_gathering_timeout_ms
                ),
            });
        }

        if call.ice_gathering_timeout_ms >= call.connection_timeout_ms {
            tracing::warn!(
                ice_gathering_timeout_ms = call.ice_gathering_timeout_ms,
                connection_timeout_ms = call.connection_timeout_ms,
                "ICE gathering wait is not shorter than the connection timeout"
            );
        }

        Ok(())
    }

    fn validate_media(&self) -> Result<(), ConfigError> {
        if self.media.ice_servers.is_empty() {
            tracing::warn!("No ICE servers configured; only host candidates will be gathered");
        }

        for (i, server) in self.media.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("media.ice_servers[{}].urls", i),
                    message: "At least one URL is required".to_string(),
                });
            }

            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(ConfigError::InvalidValue {
                        field: format!("media.ice_servers[{}].urls", i),
                        message: format!("Unsupported ICE URL scheme: '{}'", url),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_fallback(&self) -> Result<(), ConfigError> {
        let fallback = &self.fallback;

        if fallback.chunk_duration_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fallback.chunk_duration_ms".to_string(),
                message: "Must be at least 1ms".to_string(),
            });
        }

        if fallback.chunk_duration_ms >= fallback.chunk_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "fallback.chunk_duration_ms".to_string(),
                message: format!(
                    "Must be shorter than chunk_interval_ms ({})",
                    fallback.chunk_interval_ms
                ),
            });
        }

        Ok(())
    }
}

/// Signaling backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling backend
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Consecutive failed reconnects before an active call is ended
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_attempt_timeout")]
    pub reconnect_attempt_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_backoff")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "default_reconnect_max_backoff")]
    pub reconnect_max_backoff_ms: u64,

    /// Capacity of the outbound frame queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl SignalingConfig {
    pub fn reconnect_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_attempt_timeout_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }
}

fn default_signaling_url() -> String {
    signaling::DEFAULT_URL.to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    signaling::MAX_RECONNECT_ATTEMPTS
}
fn default_reconnect_attempt_timeout() -> u64 {
    signaling::RECONNECT_ATTEMPT_TIMEOUT_MS
}
fn default_reconnect_initial_backoff() -> u64 {
    signaling::RECONNECT_INITIAL_BACKOFF_MS
}
fn default_reconnect_max_backoff() -> u64 {
    signaling::RECONNECT_MAX_BACKOFF_MS
}
fn default_outbound_buffer() -> usize {
    signaling::OUTBOUND_BUFFER
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_attempt_timeout_ms: default_reconnect_attempt_timeout(),
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Call setup, timeouts and recovery budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Recovery attempts per session
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,

    /// Time allowed to reach Connected after setup or a recovery attempt
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    /// Time an unanswered call may ring
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_ms: u64,

    /// Bound on the ICE gathering wait
    #[serde(default = "default_ice_gathering_timeout")]
    pub ice_gathering_timeout_ms: u64,

    #[serde(default = "default_ice_poll_interval")]
    pub ice_poll_interval_ms: u64,

    /// First backoff between recovery attempts (doubles per attempt)
    #[serde(default = "default_recovery_backoff")]
    pub recovery_backoff_ms: u64,

    /// Treat "not found" server errors as transient while Connecting
    #[serde(default = "default_true")]
    pub tolerate_not_found_while_connecting: bool,
}

impl CallConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn ice_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ice_poll_interval_ms)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }
}

fn default_max_connection_retries() -> u32 {
    call::MAX_CONNECTION_RETRIES
}
fn default_connection_timeout() -> u64 {
    call::CONNECTION_TIMEOUT_MS
}
fn default_ring_timeout() -> u64 {
    call::RING_TIMEOUT_MS
}
fn default_ice_gathering_timeout() -> u64 {
    ice::GATHERING_TIMEOUT_MS
}
fn default_ice_poll_interval() -> u64 {
    ice::POLL_INTERVAL_MS
}
fn default_recovery_backoff() -> u64 {
    call::RECOVERY_BACKOFF_MS
}
fn default_true() -> bool {
    true
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_connection_retries: default_max_connection_retries(),
            connection_timeout_ms: default_connection_timeout(),
            ring_timeout_ms: default_ring_timeout(),
            ice_gathering_timeout_ms: default_ice_gathering_timeout(),
            ice_poll_interval_ms: default_ice_poll_interval(),
            recovery_backoff_ms: default_recovery_backoff(),
            tolerate_not_found_while_connecting: true,
        }
    }
}

/// Local media and ICE servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,

    #[serde(default = "default_true")]
    pub echo_cancellation: bool,

    #[serde(default = "default_true")]
    pub noise_suppression: bool,

    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
}

impl MediaConfig {
    /// Constraints passed when acquiring the microphone
    pub fn audio_constraints(&self) -> AudioConstraints {
        AudioConstraints {
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
        }
    }
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![ice::DEFAULT_STUN_SERVER.to_string()],
        username: None,
        credential: None,
    }]
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Chunked relay fallback timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Length of each recorded segment
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_ms: u64,

    /// Period between recordings
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,
}

impl FallbackConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

fn default_chunk_duration() -> u64 {
    fallback::CHUNK_DURATION_MS
}
fn default_chunk_interval() -> u64 {
    fallback::CHUNK_INTERVAL_MS
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: default_chunk_duration(),
            chunk_interval_ms: default_chunk_interval(),
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from `config/` and the environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (VOICE_CALL__ prefix)
/// 2. config/{env}.{toml,yaml} (if env specified)
/// 3. config/default.{toml,yaml}
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from(Path::new("config"), env)
}

/// Same as [`load_settings`] with an explicit configuration directory
pub fn load_settings_from(dir: &Path, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::from(dir.join("default")).required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::from(dir.join(env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_CALL")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    tracing::debug!(
        environment = ?settings.environment,
        signaling_url = %settings.signaling.url,
        "Settings loaded"
    );

    Ok(settings)
}
