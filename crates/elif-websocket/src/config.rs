//! WebSocket engine configuration
//!
//! Values can be built in code, deserialized, or loaded from `WS_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn validation_failed<T: Into<String>>(message: T) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Where a configuration value was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    EnvVar(String),
    Default,
}

pub struct WebSocketDefaults;

impl WebSocketDefaults {
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const AUTO_PONG: bool = true;
    pub const PING_INTERVAL_SECS: u64 = 30;
    pub const CLOSE_TIMEOUT_SECS: u64 = 5;
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
    pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
    pub const MAX_PENDING_MESSAGES: usize = 1024;
    pub const MAX_WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// WebSocket protocol and connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Maximum size of a reassembled message in bytes
    pub max_message_size: usize,
    /// Maximum payload size of a single inbound frame in bytes
    pub max_frame_size: usize,
    /// Split outbound data messages into frames of at most this many bytes
    pub outbound_fragment_size: Option<usize>,
    /// Reply to Ping frames automatically
    pub auto_pong: bool,
    /// Keepalive ping interval in seconds
    pub ping_interval_secs: Option<u64>,
    /// How long a CLOSING connection waits for the peer before the socket is dropped
    pub close_timeout_secs: u64,
    /// Time allowed for a client to send its upgrade request
    pub handshake_timeout_secs: u64,
    /// Time graceful shutdown waits for connections to drain
    pub shutdown_timeout_secs: u64,
    /// Outbound queue depth per connection
    pub max_pending_messages: usize,
    /// Outstanding outbound bytes allowed per connection
    pub max_write_buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: WebSocketDefaults::MAX_MESSAGE_SIZE,
            max_frame_size: WebSocketDefaults::MAX_FRAME_SIZE,
            outbound_fragment_size: None,
            auto_pong: WebSocketDefaults::AUTO_PONG,
            ping_interval_secs: Some(WebSocketDefaults::PING_INTERVAL_SECS),
            close_timeout_secs: WebSocketDefaults::CLOSE_TIMEOUT_SECS,
            handshake_timeout_secs: WebSocketDefaults::HANDSHAKE_TIMEOUT_SECS,
            shutdown_timeout_secs: WebSocketDefaults::SHUTDOWN_TIMEOUT_SECS,
            max_pending_messages: WebSocketDefaults::MAX_PENDING_MESSAGES,
            max_write_buffer_size: WebSocketDefaults::MAX_WRITE_BUFFER_SIZE,
        }
    }
}

impl WebSocketConfig {
    /// Load configuration from `WS_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_message_size: parse_env("WS_MAX_MESSAGE_SIZE", "max_message_size", "valid number of bytes")?
                .unwrap_or(defaults.max_message_size),
            max_frame_size: parse_env("WS_MAX_FRAME_SIZE", "max_frame_size", "valid number of bytes")?
                .unwrap_or(defaults.max_frame_size),
            outbound_fragment_size: parse_env(
                "WS_OUTBOUND_FRAGMENT_SIZE",
                "outbound_fragment_size",
                "valid number of bytes",
            )?
            .or(defaults.outbound_fragment_size),
            auto_pong: parse_env("WS_AUTO_PONG", "auto_pong", "true or false")?
                .unwrap_or(defaults.auto_pong),
            ping_interval_secs: match parse_env::<u64>(
                "WS_PING_INTERVAL",
                "ping_interval_secs",
                "valid number of seconds (0 disables)",
            )? {
                Some(0) => None,
                Some(secs) => Some(secs),
                None => defaults.ping_interval_secs,
            },
            close_timeout_secs: parse_env("WS_CLOSE_TIMEOUT", "close_timeout_secs", "valid number of seconds")?
                .unwrap_or(defaults.close_timeout_secs),
            handshake_timeout_secs: parse_env(
                "WS_HANDSHAKE_TIMEOUT",
                "handshake_timeout_secs",
                "valid number of seconds",
            )?
            .unwrap_or(defaults.handshake_timeout_secs),
            shutdown_timeout_secs: parse_env(
                "WS_SHUTDOWN_TIMEOUT",
                "shutdown_timeout_secs",
                "valid number of seconds",
            )?
            .unwrap_or(defaults.shutdown_timeout_secs),
            max_pending_messages: parse_env(
                "WS_MAX_PENDING_MESSAGES",
                "max_pending_messages",
                "valid number of messages",
            )?
            .unwrap_or(defaults.max_pending_messages),
            max_write_buffer_size: parse_env("WS_MAX_WRITE_BUFFER", "max_write_buffer_size", "valid number of bytes")?
                .unwrap_or(defaults.max_write_buffer_size),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::validation_failed(
                "Maximum message size must be greater than 0",
            ));
        }

        if self.max_frame_size == 0 {
            return Err(ConfigError::validation_failed(
                "Maximum frame size must be greater than 0",
            ));
        }

        if self.max_frame_size > self.max_message_size {
            return Err(ConfigError::validation_failed(
                "Maximum frame size cannot exceed maximum message size",
            ));
        }

        if self.outbound_fragment_size == Some(0) {
            return Err(ConfigError::validation_failed(
                "Outbound fragment size must be greater than 0",
            ));
        }

        if self.ping_interval_secs == Some(0) {
            return Err(ConfigError::validation_failed(
                "Ping interval must be greater than 0 (use None to disable)",
            ));
        }

        if self.close_timeout_secs == 0
            || self.handshake_timeout_secs == 0
            || self.shutdown_timeout_secs == 0
        {
            return Err(ConfigError::validation_failed(
                "Timeouts must be greater than 0",
            ));
        }

        if self.max_pending_messages == 0 || self.max_write_buffer_size == 0 {
            return Err(ConfigError::validation_failed(
                "Outbound queue limits must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Get configuration source information for debugging
    pub fn config_sources(&self) -> HashMap<String, ConfigSource> {
        [
            ("max_message_size", "WS_MAX_MESSAGE_SIZE"),
            ("max_frame_size", "WS_MAX_FRAME_SIZE"),
            ("outbound_fragment_size", "WS_OUTBOUND_FRAGMENT_SIZE"),
            ("auto_pong", "WS_AUTO_PONG"),
            ("ping_interval_secs", "WS_PING_INTERVAL"),
            ("close_timeout_secs", "WS_CLOSE_TIMEOUT"),
            ("handshake_timeout_secs", "WS_HANDSHAKE_TIMEOUT"),
            ("shutdown_timeout_secs", "WS_SHUTDOWN_TIMEOUT"),
            ("max_pending_messages", "WS_MAX_PENDING_MESSAGES"),
            ("max_write_buffer_size", "WS_MAX_WRITE_BUFFER"),
        ]
        .into_iter()
        .map(|(field, var)| {
            let source = if env::var(var).is_ok() {
                ConfigSource::EnvVar(var.to_string())
            } else {
                ConfigSource::Default
            };
            (field.to_string(), source)
        })
        .collect()
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs.map(Duration::from_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// Unset variables yield `Ok(None)`; unparsable ones are reported with the raw value.
fn parse_env<T: std::str::FromStr>(
    key: &str,
    field: &str,
    expected: &str,
) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                value: raw,
                expected: expected.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
