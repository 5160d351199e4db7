//! Frame and message codecs
//!
//! [`FrameCodec`] turns bytes into [`Frame`]s and back. Decoding is resumable:
//! incomplete input stays in the read buffer until the next socket read
//! completes the frame. [`MessageCodec`] sits on top of it, reassembling
//! fragmented data messages while letting control frames through immediately.

use crate::config::WebSocketConfig;
use crate::error::{WebSocketError, WebSocketResult};
use crate::frame::{apply_mask, parse_close_payload, Frame, OpCode, MAX_CONTROL_FRAME_PAYLOAD};
use crate::types::WebSocketMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Which end of the connection the codec serves.
///
/// A server requires masked input and never masks output; a client does the
/// opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug)]
struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    masking_key: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

/// Frame-level codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    // Returns Ok(None) until the whole header (including the masking key) is buffered.
    fn parse_header(&self, buf: &[u8]) -> WebSocketResult<Option<FrameHeader>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        if byte0 & 0x70 != 0 {
            return Err(WebSocketError::protocol(
                "reserved bits set without a negotiated extension",
            ));
        }

        let fin = byte0 & 0x80 != 0;
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = byte1 & 0x80 != 0;
        let len7 = byte1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::protocol("fragmented control frame"));
            }
            if usize::from(len7) > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(WebSocketError::protocol(
                    "control frame payload exceeds 125 bytes",
                ));
            }
        }

        match (self.role, masked) {
            (Role::Server, false) => {
                return Err(WebSocketError::protocol("client frame is not masked"));
            }
            (Role::Client, true) => {
                return Err(WebSocketError::protocol("server frame is masked"));
            }
            _ => {}
        }

        let (payload_len, mut offset) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WebSocketError::protocol(
                        "most significant bit of 64-bit length is set",
                    ));
                }
                (len, 10)
            }
            n => (u64::from(n), 2),
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(WebSocketError::PayloadTooLarge {
                size: payload_len,
                limit: self.max_frame_size as u64,
            });
        }

        let masking_key = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(FrameHeader {
            fin,
            opcode,
            masking_key,
            header_len: offset,
            // bounded by max_frame_size above
            payload_len: payload_len as usize,
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        let Some(header) = self.parse_header(src)? else {
            return Ok(None);
        };

        let frame_len = header.header_len + header.payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header.header_len);
        let mut payload = src.split_to(header.payload_len);
        if let Some(key) = header.masking_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            masking_key: header.masking_key,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        if frame.opcode.is_control()
            && (!frame.fin || frame.payload.len() > MAX_CONTROL_FRAME_PAYLOAD)
        {
            return Err(WebSocketError::protocol(format!(
                "cannot send {:?} frame: control frames must be final and at most 125 bytes",
                frame.opcode
            )));
        }

        let masking_key = match self.role {
            Role::Server => None,
            Role::Client => Some(frame.masking_key.unwrap_or_else(rand::random)),
        };
        let mask_bit = if masking_key.is_some() { 0x80 } else { 0x00 };
        let len = frame.payload.len();

        dst.reserve(14 + len);
        dst.put_u8(u8::from(frame.fin) << 7 | frame.opcode.as_u8());
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match masking_key {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&frame.payload),
        }

        Ok(())
    }
}

#[derive(Debug)]
struct PartialMessage {
    opcode: OpCode,
    buffer: BytesMut,
}

/// Message-level codec: reassembly on the way in, optional fragmentation on the way out
#[derive(Debug)]
pub struct MessageCodec {
    frames: FrameCodec,
    max_message_size: usize,
    fragment_size: Option<usize>,
    partial: Option<PartialMessage>,
}

impl MessageCodec {
    pub fn new(role: Role, config: &WebSocketConfig) -> Self {
        Self {
            frames: FrameCodec::new(role, config.max_frame_size),
            max_message_size: config.max_message_size,
            fragment_size: config.outbound_fragment_size.filter(|size| *size > 0),
            partial: None,
        }
    }

    pub fn server(config: &WebSocketConfig) -> Self {
        Self::new(Role::Server, config)
    }

    pub fn client(config: &WebSocketConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Whether a fragmented message is currently being reassembled
    pub fn is_reassembling(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one decoded frame. Returns a message when one is complete.
    ///
    /// Control frames are returned immediately and leave any in-progress
    /// reassembly untouched.
    pub fn push_frame(&mut self, frame: Frame) -> WebSocketResult<Option<WebSocketMessage>> {
        match frame.opcode {
            OpCode::Ping => Ok(Some(WebSocketMessage::Ping(frame.payload.to_vec()))),
            OpCode::Pong => Ok(Some(WebSocketMessage::Pong(frame.payload.to_vec()))),
            OpCode::Close => Ok(Some(WebSocketMessage::Close(parse_close_payload(
                &frame.payload,
            )?))),
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(WebSocketError::protocol(
                        "new data frame while a fragmented message is in flight",
                    ));
                }
                self.check_message_size(frame.payload.len())?;

                if frame.fin {
                    Self::finish(frame.opcode, frame.payload.to_vec()).map(Some)
                } else {
                    self.partial = Some(PartialMessage {
                        opcode: frame.opcode,
                        buffer: BytesMut::from(&frame.payload[..]),
                    });
                    Ok(None)
                }
            }
            OpCode::Continuation => {
                let buffered = match &self.partial {
                    Some(partial) => partial.buffer.len(),
                    None => {
                        return Err(WebSocketError::protocol(
                            "continuation frame without a message in flight",
                        ))
                    }
                };
                self.check_message_size(buffered + frame.payload.len())?;

                let Some(mut partial) = self.partial.take() else {
                    return Ok(None);
                };
                partial.buffer.extend_from_slice(&frame.payload);

                if frame.fin {
                    Self::finish(partial.opcode, partial.buffer.to_vec()).map(Some)
                } else {
                    self.partial = Some(partial);
                    Ok(None)
                }
            }
        }
    }

    /// Split an outbound message into wire frames
    pub fn frames_for(&self, message: WebSocketMessage) -> Vec<Frame> {
        let (opcode, payload) = match message {
            WebSocketMessage::Text(text) => (OpCode::Text, Bytes::from(text)),
            WebSocketMessage::Binary(data) => (OpCode::Binary, Bytes::from(data)),
            WebSocketMessage::Ping(data) => return vec![Frame::ping(data)],
            WebSocketMessage::Pong(data) => return vec![Frame::pong(data)],
            WebSocketMessage::Close(frame) => return vec![Frame::close(frame.as_ref())],
        };

        match self.fragment_size {
            Some(size) if size > 0 && payload.len() > size => {
                let mut frames = Vec::with_capacity(payload.len().div_ceil(size));
                let mut offset = 0;
                while offset < payload.len() {
                    let end = (offset + size).min(payload.len());
                    let frame_opcode = if offset == 0 { opcode } else { OpCode::Continuation };
                    frames.push(Frame::new(
                        end == payload.len(),
                        frame_opcode,
                        payload.slice(offset..end),
                    ));
                    offset = end;
                }
                frames
            }
            _ => vec![Frame::new(true, opcode, payload)],
        }
    }

    fn check_message_size(&self, size: usize) -> WebSocketResult<()> {
        if size > self.max_message_size {
            return Err(WebSocketError::PayloadTooLarge {
                size: size as u64,
                limit: self.max_message_size as u64,
            });
        }
        Ok(())
    }

    fn finish(opcode: OpCode, payload: Vec<u8>) -> WebSocketResult<WebSocketMessage> {
        match opcode {
            OpCode::Text => String::from_utf8(payload)
                .map(WebSocketMessage::Text)
                .map_err(|_| WebSocketError::InvalidPayload("text message is not valid UTF-8".into())),
            _ => Ok(WebSocketMessage::Binary(payload)),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = WebSocketMessage;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WebSocketMessage>, WebSocketError> {
        while let Some(frame) = self.frames.decode(src)? {
            if let Some(message) = self.push_frame(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

impl Encoder<WebSocketMessage> for MessageCodec {
    type Error = WebSocketError;

    fn encode(&mut self, message: WebSocketMessage, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        for frame in self.frames_for(message) {
            self.frames.encode(frame, dst)?;
        }
        Ok(())
    }
}
