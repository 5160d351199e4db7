//! Core WebSocket types for the elif gateway engine
//!
//! These are the framework-native values that flow between the codec, the
//! connection driver and application gateways.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for WebSocket connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status codes carried in the first two bytes of a Close frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled
    Normal,
    /// 1001: server shutting down or client navigating away
    GoingAway,
    /// 1002: malformed frame or protocol violation
    Protocol,
    /// 1003: data type the endpoint cannot accept
    Unsupported,
    /// 1005: no status code was present (never sent on the wire)
    NoStatus,
    /// 1006: connection dropped without a Close frame (never sent on the wire)
    Abnormal,
    /// 1007: text payload was not valid UTF-8
    InvalidPayload,
    /// 1008: generic policy violation
    Policy,
    /// 1009: message exceeds the configured maximum
    TooBig,
    /// 1010: client expected an extension the server did not negotiate
    MandatoryExtension,
    /// 1011: unexpected condition inside the server
    Internal,
    /// Any other code (library or application range)
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Protocol => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::Internal => 1011,
            Self::Other(code) => code,
        }
    }

    /// Whether this code may legally appear inside a Close frame.
    pub fn is_sendable(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::Internal,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Close frame information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new<T: Into<String>>(code: CloseCode, reason: T) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }
}

/// A complete logical message, after reassembly of any fragments
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketMessage {
    /// Text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
    /// Ping frame
    Ping(Vec<u8>),
    /// Pong frame
    Pong(Vec<u8>),
    /// Close frame
    Close(Option<CloseFrame>),
}

/// Message type for routing and handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl WebSocketMessage {
    pub fn text<T: Into<String>>(content: T) -> Self {
        Self::Text(content.into())
    }

    pub fn binary<T: Into<Vec<u8>>>(data: T) -> Self {
        Self::Binary(data.into())
    }

    pub fn ping<T: Into<Vec<u8>>>(data: T) -> Self {
        Self::Ping(data.into())
    }

    pub fn pong<T: Into<Vec<u8>>>(data: T) -> Self {
        Self::Pong(data.into())
    }

    pub fn close() -> Self {
        Self::Close(None)
    }

    pub fn close_with_reason<T: Into<String>>(code: CloseCode, reason: T) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::Text,
            Self::Binary(_) => MessageType::Binary,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Close(_) => MessageType::Close,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close(_))
    }

    /// Payload size in bytes as it will appear on the wire
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close(Some(frame)) => 2 + frame.reason.len(),
            Self::Close(None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection lifecycle state.
///
/// Transitions only ever move forward: `Connecting -> Open -> Closing -> Closed`.
/// Steps may be skipped (a transport error takes `Open` straight to `Closed`)
/// but a state is never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Upgrade request accepted, handshake not yet written
    Connecting,
    /// Handshake complete, frames flow both ways
    Open,
    /// A Close frame has been sent or received
    Closing,
    /// Socket released
    Closed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        next > *self
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_conversion() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 4000] {
            assert_eq!(CloseCode::from(code).as_u16(), code);
        }
        assert_eq!(CloseCode::from(1009), CloseCode::TooBig);
        assert_eq!(u16::from(CloseCode::Protocol), 1002);
    }

    #[test]
    fn test_close_code_sendable() {
        assert!(CloseCode::Normal.is_sendable());
        assert!(CloseCode::Internal.is_sendable());
        assert!(CloseCode::Other(3000).is_sendable());
        assert!(!CloseCode::NoStatus.is_sendable());
        assert!(!CloseCode::Abnormal.is_sendable());
        assert!(!CloseCode::Other(999).is_sendable());
        assert!(!CloseCode::Other(1015).is_sendable());
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        use ConnectionState::*;

        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn test_message_helpers() {
        let msg = WebSocketMessage::text("hello");
        assert!(msg.is_text());
        assert_eq!(msg.message_type(), MessageType::Text);
        assert_eq!(msg.len(), 5);

        let close = WebSocketMessage::close_with_reason(CloseCode::Normal, "bye");
        assert!(close.is_control());
        assert_eq!(close.len(), 5);
        assert!(WebSocketMessage::close().is_empty());
    }
}
