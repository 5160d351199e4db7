//! HTTP/1.1 upgrade handshake
//!
//! Validates the client's upgrade request, derives `Sec-WebSocket-Accept`
//! and writes the raw `101 Switching Protocols` response straight to the
//! socket. After that response the stream carries only WebSocket frames.

use crate::error::{WebSocketError, WebSocketResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version accepted
pub const WEBSOCKET_VERSION: &str = "13";

/// Upper bound on the size of an upgrade request head
pub const MAX_REQUEST_HEAD_SIZE: usize = 8 * 1024;

/// Parsed upgrade request, as handed over by a router or read off a socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    /// Request path without the query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<SocketAddr>,
}

impl UpgradeRequest {
    pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self {
            method: method.into(),
            path: strip_query(&path.into()).to_string(),
            headers: Vec::new(),
            remote_addr: None,
        }
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Case-insensitive header lookup; returns the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parse a request head (request line + headers, up to the blank line)
    pub fn parse(head: &[u8]) -> WebSocketResult<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| WebSocketError::handshake("request head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| WebSocketError::handshake("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version)) => (method, target, version),
            _ => {
                return Err(WebSocketError::handshake(format!(
                    "malformed request line: {}",
                    request_line
                )))
            }
        };
        if version != "HTTP/1.1" {
            return Err(WebSocketError::handshake(format!(
                "unsupported HTTP version: {}",
                version
            )));
        }

        let mut request = Self::new(method, target);
        for line in lines.take_while(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WebSocketError::handshake(format!("malformed header: {}", line)))?;
            request = request.with_header(name.trim(), value.trim());
        }
        Ok(request)
    }
}

fn strip_query(target: &str) -> &str {
    target.split_once('?').map_or(target, |(path, _)| path)
}

/// `base64(SHA1(key + GUID))`
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|value| {
        value
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    })
}

/// Validate an upgrade request and return the `Sec-WebSocket-Accept` value
pub fn negotiate(request: &UpgradeRequest) -> WebSocketResult<String> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(WebSocketError::handshake(format!(
            "upgrade requires GET, got {}",
            request.method
        )));
    }
    if !has_token(request.header("upgrade"), "websocket") {
        return Err(WebSocketError::handshake("missing 'Upgrade: websocket' header"));
    }
    if !has_token(request.header("connection"), "upgrade") {
        return Err(WebSocketError::handshake("missing 'Connection: Upgrade' header"));
    }

    match request.header("sec-websocket-version") {
        Some(version) if version.trim() == WEBSOCKET_VERSION => {}
        Some(version) => {
            return Err(WebSocketError::handshake(format!(
                "unsupported Sec-WebSocket-Version: {}",
                version
            )))
        }
        None => return Err(WebSocketError::handshake("missing Sec-WebSocket-Version header")),
    }

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| WebSocketError::handshake("missing Sec-WebSocket-Key header"))?;
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(accept_key(key)),
        _ => Err(WebSocketError::handshake(
            "invalid Sec-WebSocket-Key (must be base64 of 16 bytes)",
        )),
    }
}

/// The exact `101 Switching Protocols` response for an accept value
pub fn handshake_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    )
}

pub async fn write_handshake_response<W>(writer: &mut W, accept: &str) -> WebSocketResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(handshake_response(accept).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Answer a rejected upgrade with a plain HTTP error
pub async fn write_rejection<W>(writer: &mut W, status: u16, reason: &str, body: &str) -> WebSocketResult<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and parse an upgrade request head from a raw stream.
///
/// Bytes received after the blank line (a client that pipelines its first
/// frame) are returned alongside the request.
pub async fn read_upgrade_request<R>(reader: &mut R) -> WebSocketResult<(UpgradeRequest, BytesMut)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buffer) {
            let head = buffer.split_to(end);
            let request = UpgradeRequest::parse(&head)?;
            return Ok((request, buffer));
        }
        if buffer.len() >= MAX_REQUEST_HEAD_SIZE {
            return Err(WebSocketError::handshake(format!(
                "request head exceeds {} bytes",
                MAX_REQUEST_HEAD_SIZE
            )));
        }
        if reader.read_buf(&mut buffer).await? == 0 {
            return Err(WebSocketError::handshake(
                "connection closed before request head was complete",
            ));
        }
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> UpgradeRequest {
        UpgradeRequest::new("GET", "/chat")
            .with_header("Host", "example.com")
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "keep-alive, Upgrade")
            .with_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .with_header("Sec-WebSocket-Version", "13")
    }

    #[test]
    fn test_canonical_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_negotiate_accepts_valid_request() {
        assert_eq!(
            negotiate(&valid_request()).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_negotiate_rejections() {
        let without = |name: &str| {
            let mut request = valid_request();
            request.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
            request
        };

        assert!(negotiate(&without("Sec-WebSocket-Key")).is_err());
        assert!(negotiate(&without("Sec-WebSocket-Version")).is_err());
        assert!(negotiate(&without("Upgrade")).is_err());
        assert!(negotiate(&without("Connection")).is_err());

        let mut post = valid_request();
        post.method = "POST".to_string();
        assert!(negotiate(&post).is_err());

        let old_version = without("Sec-WebSocket-Version").with_header("Sec-WebSocket-Version", "8");
        assert!(matches!(
            negotiate(&old_version),
            Err(WebSocketError::Handshake(msg)) if msg.contains("unsupported")
        ));

        let short_key = without("Sec-WebSocket-Key").with_header("Sec-WebSocket-Key", "c2hvcnQ=");
        assert!(negotiate(&short_key).is_err());

        let not_base64 = without("Sec-WebSocket-Key").with_header("Sec-WebSocket-Key", "not base64!");
        assert!(negotiate(&not_base64).is_err());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = UpgradeRequest::new("get", "/chat")
            .with_header("UPGRADE", "WebSocket")
            .with_header("connection", "UPGRADE")
            .with_header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .with_header("SEC-WEBSOCKET-VERSION", "13");
        assert!(negotiate(&request).is_ok());
    }

    #[test]
    fn test_response_is_exact() {
        assert_eq!(
            handshake_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_request_head() {
        let head = b"GET /chat?token=abc HTTP/1.1\r\n\
                     Host: localhost\r\n\
                     Upgrade: websocket\r\n\
                     Sec-WebSocket-Key:   dGhlIHNhbXBsZSBub25jZQ==  \r\n\r\n";
        let request = UpgradeRequest::parse(head).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/chat");
        assert_eq!(request.header("host"), Some("localhost"));
        assert_eq!(
            request.header("Sec-WebSocket-Key"),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );

        assert!(UpgradeRequest::parse(b"GET /chat HTTP/1.0\r\n\r\n").is_err());
        assert!(UpgradeRequest::parse(b"GARBAGE\r\n\r\n").is_err());
        assert!(UpgradeRequest::parse(b"GET / HTTP/1.1\r\nno-colon\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_upgrade_request_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\r\n\x81\x80")
            .await
            .unwrap();

        let (request, leftover) = read_upgrade_request(&mut server).await.unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(&leftover[..], &[0x81, 0x80]);
    }

    #[tokio::test]
    async fn test_read_upgrade_request_across_reads() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"GET /chat HTTP/1.1\r\nUpgr")
            .read(b"ade: websocket\r\n\r\n")
            .build();

        let (request, leftover) = read_upgrade_request(&mut stream).await.unwrap();
        assert_eq!(request.header("upgrade"), Some("websocket"));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_upgrade_request_rejects_oversized_head() {
        let (mut client, mut server) = tokio::io::duplex(MAX_REQUEST_HEAD_SIZE * 2);
        let mut head = b"GET /chat HTTP/1.1\r\n".to_vec();
        head.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD_SIZE));
        client.write_all(&head).await.unwrap();

        assert!(matches!(
            read_upgrade_request(&mut server).await,
            Err(WebSocketError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_read_upgrade_request_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"GET /chat HTTP/1.1\r\n").await.unwrap();
        drop(client);

        assert!(read_upgrade_request(&mut server).await.is_err());
    }
}
