//! WebSocket frame model
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                    Masking key (if MASK set)                  |
//! +---------------------------------------------------------------+
//! |                          Payload data                         |
//! +---------------------------------------------------------------+
//! ```

use crate::error::{WebSocketError, WebSocketResult};
use crate::types::{CloseCode, CloseFrame};
use bytes::Bytes;
use tracing::warn;

/// Maximum payload size for control frames
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> WebSocketResult<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WebSocketError::protocol(format!(
                "reserved opcode 0x{:X}",
                other
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A single wire frame.
///
/// `payload` always holds the unmasked bytes; `masking_key` records the key
/// the frame carried (or should carry) on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            masking_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, data)
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    pub fn continuation(fin: bool, data: impl Into<Bytes>) -> Self {
        Self::new(fin, OpCode::Continuation, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, data)
    }

    pub fn close(frame: Option<&CloseFrame>) -> Self {
        let payload = frame.map(encode_close_payload).unwrap_or_default();
        Self::new(true, OpCode::Close, payload)
    }

    pub fn with_masking_key(mut self, key: [u8; 4]) -> Self {
        self.masking_key = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.masking_key.is_some()
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// XOR `buf` in place with `key`, byte `i` against `key[i % 4]`.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Serialize a close frame as a 2-byte big-endian code followed by the
/// UTF-8 reason, truncated so the whole payload fits in a control frame.
///
/// Codes that may not appear on the wire (1005, 1006, 1015, unassigned
/// ranges) are replaced by 1000.
pub fn encode_close_payload(frame: &CloseFrame) -> Vec<u8> {
    let code = if frame.code.is_sendable() {
        frame.code
    } else {
        warn!(code = %frame.code, "Close code may not be sent, using 1000 instead");
        CloseCode::Normal
    };
    let max_reason = MAX_CONTROL_FRAME_PAYLOAD - 2;
    let mut end = frame.reason.len().min(max_reason);
    while !frame.reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(&frame.reason.as_bytes()[..end]);
    payload
}

/// Parse a Close frame payload. An empty payload carries no status.
pub fn parse_close_payload(payload: &[u8]) -> WebSocketResult<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(WebSocketError::protocol(
            "close payload must be empty or at least 2 bytes",
        )),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_sendable() {
                return Err(WebSocketError::protocol(format!(
                    "invalid close code {}",
                    code
                )));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WebSocketError::protocol("close reason is not valid UTF-8"))?;
            Ok(Some(CloseFrame::new(code, reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        for (byte, opcode) in [
            (0x0, OpCode::Continuation),
            (0x1, OpCode::Text),
            (0x2, OpCode::Binary),
            (0x8, OpCode::Close),
            (0x9, OpCode::Ping),
            (0xA, OpCode::Pong),
        ] {
            assert_eq!(OpCode::from_u8(byte).unwrap(), opcode);
            assert_eq!(opcode.as_u8(), byte);
        }
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for byte in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::from_u8(byte),
                Err(WebSocketError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_control_opcodes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_mask_is_self_inverse() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1031).collect();
        let key = [0x37, 0xfa, 0x21, 0x3d];

        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_known_vector() {
        // "Hello" masked with 37 fa 21 3d
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let frame = CloseFrame::new(CloseCode::Protocol, "bad frame");
        let payload = encode_close_payload(&frame);
        assert_eq!(&payload[..2], &[0x03, 0xEA]);
        assert_eq!(parse_close_payload(&payload).unwrap(), Some(frame));
    }

    #[test]
    fn test_close_payload_edge_cases() {
        assert_eq!(parse_close_payload(&[]).unwrap(), None);
        assert!(parse_close_payload(&[0x03]).is_err());
        // 1005 may never appear on the wire
        assert!(parse_close_payload(&[0x03, 0xED]).is_err());
        assert!(parse_close_payload(&[0x03, 0xE8, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_reserved_close_codes_are_never_encoded() {
        for code in [CloseCode::NoStatus, CloseCode::Abnormal, CloseCode::from(999)] {
            let payload = encode_close_payload(&CloseFrame::new(code, "bye"));
            assert_eq!(&payload[..2], &1000u16.to_be_bytes());
            assert_eq!(
                parse_close_payload(&payload).unwrap(),
                Some(CloseFrame::new(CloseCode::Normal, "bye"))
            );
        }
    }

    #[test]
    fn test_close_reason_truncated_to_control_limit() {
        let frame = CloseFrame::new(CloseCode::Normal, "é".repeat(100));
        let payload = encode_close_payload(&frame);
        assert!(payload.len() <= MAX_CONTROL_FRAME_PAYLOAD);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());
    }
}
