//! Server-Sent Events
//!
//! One-directional alternative to WebSocket gateways: a long-lived
//! `text/event-stream` HTTP response carrying `event:`/`data:` records.

use crate::error::WebSocketResult;
use serde::Serialize;
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const STREAM_HEADER: &str = "HTTP/1.1 200 OK\r\n\
                             Content-Type: text/event-stream\r\n\
                             Cache-Control: no-cache\r\n\
                             Connection: keep-alive\r\n\
                             \r\n";

/// A single SSE record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Reconnection delay hint in milliseconds
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Named event with a JSON-serialized payload
    pub fn json<T: Serialize>(event: &str, data: &T) -> WebSocketResult<Self> {
        Ok(Self::new(event, serde_json::to_string(data)?))
    }

    /// Named event with a raw text payload
    pub fn new<E: Into<String>, D: Into<String>>(event: E, data: D) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Unnamed event, delivered to the client's `message` listener
    pub fn data<D: Into<String>>(data: D) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    pub fn with_id<I: Into<String>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    /// Wire form of the record, terminated by a blank line
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            let _ = writeln!(out, "id: {}", single_line(id));
        }
        if let Some(event) = &self.event {
            let _ = writeln!(out, "event: {}", single_line(event));
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(out, "retry: {}", retry);
        }
        // each line of the payload needs its own data field
        for line in self.data.split('\n') {
            let _ = writeln!(out, "data: {}", line.strip_suffix('\r').unwrap_or(line));
        }
        out.push('\n');
        out
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Event stream over any writer; the response header is written before the first record
pub struct SseStream<W> {
    writer: W,
    header_sent: bool,
}

impl<W: AsyncWrite + Unpin> SseStream<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_sent: false,
        }
    }

    pub async fn send(&mut self, event: &SseEvent) -> WebSocketResult<()> {
        self.ensure_header().await?;
        self.writer.write_all(event.render().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Comment line, ignored by clients; keeps idle proxies from timing out
    pub async fn keepalive(&mut self) -> WebSocketResult<()> {
        self.ensure_header().await?;
        self.writer.write_all(b": keepalive\n\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn ensure_header(&mut self) -> WebSocketResult<()> {
        if !self.header_sent {
            self.writer.write_all(STREAM_HEADER.as_bytes()).await?;
            self.header_sent = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_named_json_event() {
        let event = SseEvent::json("price", &json!({"symbol": "ABC", "value": 42})).unwrap();
        assert_eq!(
            event.render(),
            "event: price\ndata: {\"symbol\":\"ABC\",\"value\":42}\n\n"
        );
    }

    #[test]
    fn test_render_multiline_data() {
        let event = SseEvent::data("first\nsecond\r\nthird").with_id("7").with_retry(1500);
        assert_eq!(
            event.render(),
            "id: 7\nretry: 1500\ndata: first\ndata: second\ndata: third\n\n"
        );
    }

    #[test]
    fn test_event_name_cannot_break_framing() {
        let event = SseEvent::new("bad\nname", "x");
        assert_eq!(event.render(), "event: bad name\ndata: x\n\n");
    }

    #[tokio::test]
    async fn test_stream_writes_header_once() {
        let mut stream = SseStream::new(Vec::new());
        stream.send(&SseEvent::new("a", "1")).await.unwrap();
        stream.keepalive().await.unwrap();
        stream.send(&SseEvent::new("b", "2")).await.unwrap();

        let written = String::from_utf8(stream.into_inner()).unwrap();
        assert_eq!(written.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(written.contains("Content-Type: text/event-stream\r\n"));
        assert!(written.ends_with("event: a\ndata: 1\n\n: keepalive\n\nevent: b\ndata: 2\n\n"));
    }
}
