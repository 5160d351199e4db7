//! Structured logging setup for the WebSocket engine
//!
//! The engine itself only emits `tracing` events (targets under
//! `elif_websocket`); this module installs a subscriber for binaries and demos.

use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Enable pretty printing for development
    pub pretty_print: bool,
    /// Environment filter (e.g. "elif_websocket=debug,tokio=warn")
    pub env_filter: Option<String>,
    /// Custom fields included in the initialization record
    pub global_fields: serde_json::Map<String, Value>,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: true,
            env_filter: None,
            global_fields: serde_json::Map::new(),
            service_name: None,
            service_version: None,
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            pretty_print: false,
            env_filter: Some("elif_websocket=info".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "production")
    }

    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            pretty_print: true,
            env_filter: Some("elif_websocket=debug".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "development")
    }

    /// Minimal output for test runs
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            json_format: false,
            pretty_print: false,
            env_filter: Some("elif_websocket=error".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "test")
    }

    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_service(mut self, name: &str, version: &str) -> Self {
        self.service_name = Some(name.to_string());
        self.service_version = Some(version.to_string());
        self
    }

    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn filter_directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails instead of
/// panicking when a global subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout).json())
            .try_init()?;
    } else if config.pretty_print {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout).pretty())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout))
            .try_init()?;
    }

    let mut init_msg = json!({
        "message": "Structured logging initialized",
        "level": config.level,
        "json_format": config.json_format,
    });
    if let Some(name) = config.service_name {
        init_msg["service_name"] = json!(name);
    }
    if let Some(version) = config.service_version {
        init_msg["service_version"] = json!(version);
    }
    for (key, value) in config.global_fields {
        init_msg[key] = value;
    }

    tracing::info!(target: "elif_websocket::logging", "{}", init_msg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let prod = LoggingConfig::production();
        assert!(prod.json_format);
        assert_eq!(prod.global_fields.get("env"), Some(&json!("production")));
        assert_eq!(prod.filter_directive(), "elif_websocket=info");

        let dev = LoggingConfig::development();
        assert!(dev.pretty_print);
        assert_eq!(dev.level, "debug");

        let default = LoggingConfig::default();
        assert_eq!(default.filter_directive(), "info");
    }

    #[test]
    fn test_builder_methods() {
        let config = LoggingConfig::test()
            .with_service("chat", "1.2.3")
            .with_env_filter("elif_websocket=trace")
            .with_global_field("region", "eu");

        assert_eq!(config.service_name.as_deref(), Some("chat"));
        assert_eq!(config.service_version.as_deref(), Some("1.2.3"));
        assert_eq!(config.filter_directive(), "elif_websocket=trace");
        assert_eq!(config.global_fields.get("region"), Some(&json!("eu")));
    }
}
