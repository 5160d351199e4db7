//! WebSocket error types
//!
//! Protocol-level failures are turned into close codes by the connection
//! driver and never reach application code. Only [`HandlerError`] is
//! application-facing.

use crate::config::ConfigError;
use crate::types::{CloseCode, ConnectionId};
use std::fmt;
use thiserror::Error;

/// Result type for WebSocket operations
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// WebSocket engine errors
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Gateway already registered for path: {0}")]
    DuplicateGateway(String),

    #[error("No gateway registered for path: {0}")]
    GatewayNotFound(String),

    #[error("Invalid gateway path: {0}")]
    InvalidGatewayPath(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WebSocketError {
    pub fn handshake<T: Into<String>>(message: T) -> Self {
        Self::Handshake(message.into())
    }

    pub fn protocol<T: Into<String>>(message: T) -> Self {
        Self::Protocol(message.into())
    }

    /// Close code the engine sends to the peer for this error.
    ///
    /// Returns `None` for transport failures, where the socket is already
    /// unusable and no close handshake is possible.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Io(_) | Self::ConnectionClosed => None,
            Self::Protocol(_) | Self::Handshake(_) => Some(CloseCode::Protocol),
            Self::PayloadTooLarge { .. } => Some(CloseCode::TooBig),
            Self::InvalidPayload(_) => Some(CloseCode::InvalidPayload),
            _ => Some(CloseCode::Internal),
        }
    }

    /// Whether the error originates from the transport rather than the protocol
    pub fn is_transport(&self) -> bool {
        self.close_code().is_none()
    }
}

impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised by a gateway handler.
///
/// Handler errors are caught per message and logged; they never close the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new<T: Into<String>>(message: T) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid event data: {}", err))
    }
}

impl From<WebSocketError> for HandlerError {
    fn from(err: WebSocketError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
