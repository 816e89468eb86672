//! # Configuration Management
//!
//! Centralized configuration for the protocol stack.
//!
//! This module provides structured configuration for channels, servers and
//! clients, including frame limits, timeouts and logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment-specific overrides via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The frame length cap bounds per-connection memory against hostile
//!   length fields (16 MB default)
//! - The handshake length cap defends against unbounded header buffering
//!   from a slow or malicious peer

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Max allowed frame payload size (16 MB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Max allowed WebSocket handshake header block.
pub const MAX_HANDSHAKE_LENGTH: usize = 4096;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-channel tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest frame payload accepted before the connection is failed.
    pub max_frame_length: usize,

    /// Largest WebSocket handshake header block accepted on the server
    /// side.
    pub max_handshake_length: usize,

    /// Default timeout applied to requests driven through the net
    /// helpers.
    pub request_timeout: Duration,

    /// Tear the channel down (WebSocket: send an automatic CLOSE) after
    /// this long without received bytes. `None` disables the check.
    pub inactivity_timeout: Option<Duration>,

    /// Disable Nagle's algorithm on the socket.
    pub nodelay: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
            max_handshake_length: MAX_HANDSHAKE_LENGTH,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inactivity_timeout: None,
            nodelay: true,
        }
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7790".to_string(),
        }
    }
}

/// Client-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Time allowed for the TCP connect to complete.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level filter (`trace`, `debug`, `info`, `warn`,
    /// `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub channel: ChannelConfig,
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("STREAM_PROTOCOL_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(value) = std::env::var("STREAM_PROTOCOL_MAX_FRAME_LENGTH") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.channel.max_frame_length = parsed;
            }
        }

        if let Ok(value) = std::env::var("STREAM_PROTOCOL_REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.channel.request_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(value) = std::env::var("STREAM_PROTOCOL_INACTIVITY_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.channel.inactivity_timeout = Some(Duration::from_millis(parsed));
            }
        }

        if let Ok(level) = std::env::var("STREAM_PROTOCOL_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Sanity checks on configured values.
    pub fn validate(&self) -> Result<()> {
        if self.channel.max_frame_length == 0 {
            return Err(ProtocolError::ConfigError(
                "max_frame_length must be non-zero".into(),
            ));
        }
        if self.channel.max_handshake_length < 128 {
            return Err(ProtocolError::ConfigError(
                "max_handshake_length too small for any real handshake".into(),
            ));
        }
        if self.server.address.is_empty() {
            return Err(ProtocolError::ConfigError(
                "server.address must not be empty".into(),
            ));
        }
        Ok(())
    }
}
