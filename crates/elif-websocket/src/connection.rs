//! WebSocket connection handle and driver task
//!
//! A [`WebSocketConnection`] is a cheap, cloneable handle. The socket itself
//! is owned exclusively by a [`ConnectionDriver`] task which decodes frames,
//! runs the lifecycle state machine and writes outbound traffic.

use crate::codec::MessageCodec;
use crate::config::WebSocketConfig;
use crate::error::{WebSocketError, WebSocketResult};
use crate::gateway::{Gateway, GatewayContext, MessageEnvelope};
use crate::registry::ConnectionRegistry;
use crate::state::{Action, ConnectionStateMachine};
use crate::types::{CloseCode, CloseFrame, ConnectionId, ConnectionState, WebSocketMessage};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::{self, Interval, Sleep};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands queued from handles to the driver task
#[derive(Debug)]
pub enum Outbound {
    Message(WebSocketMessage),
    Close(CloseFrame),
}

/// Connection metadata for tracking and debugging
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// When the handshake completed
    pub connected_at: DateTime<Utc>,
    /// Remote address if available
    pub remote_addr: Option<String>,
    /// User agent if available
    pub user_agent: Option<String>,
    /// Custom metadata
    pub custom: HashMap<String, String>,
    /// Message statistics
    pub stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_activity: Option<Instant>,
}

/// Handle to a WebSocket connection
#[derive(Clone)]
pub struct WebSocketConnection {
    /// Unique connection identifier
    pub id: ConnectionId,
    /// Gateway path the connection is bound to
    path: Arc<str>,
    state: Arc<RwLock<ConnectionState>>,
    metadata: Arc<RwLock<ConnectionMetadata>>,
    sender: mpsc::Sender<Outbound>,
    pending_bytes: Arc<AtomicUsize>,
    max_write_buffer: usize,
    terminate: CancellationToken,
}

impl WebSocketConnection {
    /// Create a handle in the `Connecting` state together with the queue its driver consumes
    pub(crate) fn new(path: &str, config: &WebSocketConfig) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(config.max_pending_messages);
        let connection = Self {
            id: ConnectionId::new(),
            path: Arc::from(path),
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            metadata: Arc::new(RwLock::new(ConnectionMetadata {
                connected_at: Utc::now(),
                remote_addr: None,
                user_agent: None,
                custom: HashMap::new(),
                stats: ConnectionStats::default(),
            })),
            sender,
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            max_write_buffer: config.max_write_buffer_size,
            terminate: CancellationToken::new(),
        };
        (connection, receiver)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue a message for the peer.
    ///
    /// Never blocks: when the outbound queue or the byte budget is exhausted
    /// the message is rejected with [`WebSocketError::SendQueueFull`].
    pub async fn send(&self, message: WebSocketMessage) -> WebSocketResult<()> {
        if !self.is_active().await {
            return Err(WebSocketError::ConnectionClosed);
        }

        let size = message.len();
        let queued = self.pending_bytes.fetch_add(size, Ordering::AcqRel);
        if queued + size > self.max_write_buffer {
            self.release_pending(size);
            warn!(
                connection_id = %self.id,
                queued, size, "Outbound write buffer full, dropping message"
            );
            return Err(WebSocketError::SendQueueFull);
        }

        match self.sender.try_send(Outbound::Message(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.release_pending(size);
                warn!(connection_id = %self.id, "Outbound queue full, dropping message");
                Err(WebSocketError::SendQueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.release_pending(size);
                Err(WebSocketError::ConnectionClosed)
            }
        }
    }

    pub async fn send_text<T: Into<String>>(&self, text: T) -> WebSocketResult<()> {
        self.send(WebSocketMessage::text(text)).await
    }

    pub async fn send_binary<T: Into<Vec<u8>>>(&self, data: T) -> WebSocketResult<()> {
        self.send(WebSocketMessage::binary(data)).await
    }

    /// Send an `{event, data}` envelope as a Text message
    pub async fn emit<T: Serialize>(&self, event: &str, data: T) -> WebSocketResult<()> {
        let envelope = MessageEnvelope::new(event, serde_json::to_value(data)?);
        self.send_text(envelope.to_json()?).await
    }

    pub async fn ping<T: Into<Vec<u8>>>(&self, data: T) -> WebSocketResult<()> {
        self.send(WebSocketMessage::ping(data)).await
    }

    /// Start the closing handshake with code 1000
    pub async fn close(&self) -> WebSocketResult<()> {
        self.close_with_reason(CloseCode::Normal, "").await
    }

    /// Start the closing handshake with a specific code
    pub async fn close_with_reason<T: Into<String>>(
        &self,
        code: CloseCode,
        reason: T,
    ) -> WebSocketResult<()> {
        if self.is_closed().await {
            return Err(WebSocketError::ConnectionClosed);
        }

        match self.sender.try_send(Outbound::Close(CloseFrame::new(code, reason))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "Outbound queue full while closing, terminating");
                self.terminate();
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(WebSocketError::ConnectionClosed),
        }
    }

    /// Drop the socket immediately, without a closing handshake
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Get the current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.state().await.is_active()
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await.is_closed()
    }

    pub async fn metadata(&self) -> ConnectionMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn set_metadata(&self, key: String, value: String) {
        let mut metadata = self.metadata.write().await;
        metadata.custom.insert(key, value);
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.metadata.read().await.stats.clone()
    }

    /// Bytes queued for this connection but not yet handed to the socket
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub(crate) async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if state.can_transition_to(next) {
            *state = next;
        }
    }

    pub(crate) async fn set_peer_info(&self, remote_addr: Option<String>, user_agent: Option<String>) {
        let mut metadata = self.metadata.write().await;
        metadata.remote_addr = remote_addr;
        metadata.user_agent = user_agent;
        metadata.connected_at = Utc::now();
    }

    fn release_pending(&self, size: usize) {
        self.pending_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    async fn record_received(&self, message: &WebSocketMessage) {
        let mut metadata = self.metadata.write().await;
        metadata.stats.messages_received += 1;
        metadata.stats.bytes_received += message.len() as u64;
        metadata.stats.last_activity = Some(Instant::now());
    }

    async fn record_sent(&self, size: usize) {
        let mut metadata = self.metadata.write().await;
        metadata.stats.messages_sent += 1;
        metadata.stats.bytes_sent += size as u64;
        metadata.stats.last_activity = Some(Instant::now());
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Owns the socket of one connection for its whole lifetime
pub(crate) struct ConnectionDriver<S> {
    connection: WebSocketConnection,
    framed: Framed<S, MessageCodec>,
    outbound: mpsc::Receiver<Outbound>,
    gateway: Arc<Gateway>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<WebSocketConfig>,
}

impl<S> ConnectionDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        connection: WebSocketConnection,
        framed: Framed<S, MessageCodec>,
        outbound: mpsc::Receiver<Outbound>,
        gateway: Arc<Gateway>,
        registry: Arc<ConnectionRegistry>,
        config: Arc<WebSocketConfig>,
    ) -> Self {
        Self {
            connection,
            framed,
            outbound,
            gateway,
            registry,
            config,
        }
    }

    /// Run until the connection reaches `Closed`
    pub(crate) async fn run(self) {
        let Self {
            connection,
            mut framed,
            mut outbound,
            gateway,
            registry,
            config,
        } = self;
        let id = connection.id;
        debug!(connection_id = %id, path = %connection.path(), "Starting WebSocket driver");

        let mut machine = ConnectionStateMachine::new(config.auto_pong);
        machine.handshake_succeeded();
        connection.set_state(machine.state()).await;

        // Handlers run on their own task so slow ones never stall frame processing.
        let (inbox, dispatch_rx) = mpsc::channel(config.max_pending_messages);
        tokio::spawn(dispatch_loop(
            GatewayContext::new(connection.clone(), registry.clone()),
            gateway,
            dispatch_rx,
        ));
        // Messages decoded while the dispatcher inbox is full, in arrival order.
        let mut backlog: VecDeque<WebSocketMessage> = VecDeque::new();

        let mut keepalive = config
            .ping_interval()
            .map(|period| time::interval_at(time::Instant::now() + period, period));
        let mut close_deadline: Option<Pin<Box<Sleep>>> = None;

        loop {
            let events = tokio::select! {
                _ = connection.terminate.cancelled() => {
                    debug!(connection_id = %id, "Connection terminated locally");
                    machine.terminate()
                }
                inbound = framed.next() => match inbound {
                    Some(Ok(message)) => {
                        connection.record_received(&message).await;
                        machine.on_message(message)
                    }
                    Some(Err(err)) => {
                        if err.is_transport() {
                            warn!(connection_id = %id, "Transport error: {}", err);
                        } else {
                            warn!(connection_id = %id, "Closing connection after protocol error: {}", err);
                        }
                        machine.on_error(&err)
                    }
                    None => {
                        debug!(connection_id = %id, "Socket reached end of stream");
                        machine.on_socket_end();
                        Vec::new()
                    }
                },
                permit = inbox.reserve(), if !backlog.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(message) = backlog.pop_front() {
                                permit.send(message);
                            }
                        }
                        Err(_) => {
                            error!(connection_id = %id, "Gateway dispatcher stopped unexpectedly");
                            backlog.clear();
                        }
                    }
                    Vec::new()
                }
                command = outbound.recv(), if machine.state() == ConnectionState::Open => match command {
                    Some(Outbound::Message(message)) => {
                        connection.release_pending(message.len());
                        vec![Action::Send(message)]
                    }
                    Some(Outbound::Close(frame)) => machine.close(frame),
                    None => machine.close(CloseFrame::normal()),
                },
                _ = next_tick(&mut keepalive), if machine.state() == ConnectionState::Open => {
                    vec![Action::Send(WebSocketMessage::ping(Vec::new()))]
                }
                _ = wait_deadline(&mut close_deadline) => {
                    warn!(connection_id = %id, "Peer did not complete the closing handshake in time");
                    machine.on_close_timeout()
                }
            };
            let mut actions = VecDeque::from(events);

            while let Some(action) = actions.pop_front() {
                match action {
                    Action::Deliver(message) => {
                        if backlog.is_empty() {
                            match inbox.try_send(message) {
                                Ok(()) => {}
                                Err(TrySendError::Full(message)) => backlog.push_back(message),
                                Err(TrySendError::Closed(_)) => {
                                    error!(connection_id = %id, "Gateway dispatcher stopped unexpectedly");
                                }
                            }
                        } else {
                            backlog.push_back(message);
                        }

                        if backlog.len() > config.max_pending_messages {
                            warn!(
                                connection_id = %id,
                                backlog = backlog.len(),
                                "Gateway handlers are not keeping up, closing connection"
                            );
                            backlog.clear();
                            actions.extend(machine.close(CloseFrame::new(
                                CloseCode::Policy,
                                "message backlog exceeded",
                            )));
                        }
                    }
                    Action::Send(message) => {
                        let size = message.len();
                        let write = framed.send(message);
                        match interruptible(write, &connection.terminate, &mut close_deadline).await {
                            Ok(Ok(())) => connection.record_sent(size).await,
                            Ok(Err(err)) => {
                                error!(connection_id = %id, "Failed to write message: {}", err);
                                machine.terminate();
                            }
                            Err(stop) => stop.apply(&mut machine, id),
                        }
                    }
                    Action::SendClose(frame) => {
                        info!(connection_id = %id, code = %frame.code, "Sending close frame");
                        // The grace period also bounds writing the Close frame itself.
                        close_deadline = Some(Box::pin(time::sleep(config.close_timeout())));
                        let close = framed.send(WebSocketMessage::Close(Some(frame)));
                        match interruptible(close, &connection.terminate, &mut close_deadline).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(connection_id = %id, "Failed to write close frame: {}", err);
                                machine.terminate();
                            }
                            Err(stop) => stop.apply(&mut machine, id),
                        }
                    }
                    Action::Finish => {
                        let shutdown = SinkExt::<WebSocketMessage>::close(&mut framed);
                        match interruptible(shutdown, &connection.terminate, &mut close_deadline).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                debug!(connection_id = %id, "Error shutting down socket: {}", err);
                            }
                            Err(stop) => stop.apply(&mut machine, id),
                        }
                        machine.on_socket_end();
                    }
                    Action::Terminate => {}
                }

                if machine.state().is_closed() {
                    break;
                }
            }

            connection.set_state(machine.state()).await;
            if machine.state().is_closed() {
                break;
            }
        }

        // Dropping the inbox lets the dispatcher finish in-flight work and run the disconnect hook.
        if !backlog.is_empty() {
            debug!(connection_id = %id, dropped = backlog.len(), "Discarding undelivered messages");
        }
        drop(inbox);
        drop(framed);
        connection.set_state(ConnectionState::Closed).await;
        registry.remove_connection(id).await;
        info!(connection_id = %id, "WebSocket connection closed");
    }
}

/// Why a socket write was abandoned before it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupted {
    Terminated,
    CloseTimeout,
}

impl Interrupted {
    fn apply(self, machine: &mut ConnectionStateMachine, id: ConnectionId) {
        match self {
            Self::Terminated => {
                debug!(connection_id = %id, "Connection terminated during a write");
                machine.terminate();
            }
            Self::CloseTimeout => {
                warn!(connection_id = %id, "Closing handshake timed out during a write");
                machine.terminate();
            }
        }
    }
}

/// Drive `work` unless the connection is terminated or its close deadline passes first
async fn interruptible<F: Future>(
    work: F,
    terminate: &CancellationToken,
    deadline: &mut Option<Pin<Box<Sleep>>>,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        output = work => Ok(output),
        _ = terminate.cancelled() => Err(Interrupted::Terminated),
        _ = wait_deadline(deadline) => Err(Interrupted::CloseTimeout),
    }
}

async fn dispatch_loop(
    ctx: GatewayContext,
    gateway: Arc<Gateway>,
    mut inbox: mpsc::Receiver<WebSocketMessage>,
) {
    gateway.connected(&ctx).await;
    while let Some(message) = inbox.recv().await {
        gateway.dispatch(&ctx, message).await;
    }
    gateway.disconnected(&ctx).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> WebSocketConfig {
        WebSocketConfig {
            max_pending_messages: 2,
            max_write_buffer_size: 10,
            ..WebSocketConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        let (connection, _rx) = WebSocketConnection::new("/chat", &config());
        assert_eq!(connection.state().await, ConnectionState::Connecting);
        assert!(matches!(
            connection.send_text("hi").await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_queues_outbound_message() {
        let (connection, mut rx) = WebSocketConnection::new("/chat", &config());
        connection.set_state(ConnectionState::Open).await;

        connection.send_text("hello").await.unwrap();
        assert_eq!(connection.pending_bytes(), 5);

        match rx.recv().await {
            Some(Outbound::Message(message)) => assert_eq!(message, WebSocketMessage::text("hello")),
            other => panic!("unexpected outbound command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_buffer_limit() {
        let (connection, _rx) = WebSocketConnection::new("/chat", &config());
        connection.set_state(ConnectionState::Open).await;

        connection.send_text("123456").await.unwrap();
        assert!(matches!(
            connection.send_text("123456").await,
            Err(WebSocketError::SendQueueFull)
        ));
        assert_eq!(connection.pending_bytes(), 6);
    }

    #[tokio::test]
    async fn test_queue_depth_limit() {
        let (connection, _rx) = WebSocketConnection::new("/chat", &config());
        connection.set_state(ConnectionState::Open).await;

        connection.send_text("a").await.unwrap();
        connection.send_text("b").await.unwrap();
        assert!(matches!(
            connection.send_text("c").await,
            Err(WebSocketError::SendQueueFull)
        ));
        assert_eq!(connection.pending_bytes(), 2);
    }

    #[tokio::test]
    async fn test_send_after_driver_gone() {
        let (connection, rx) = WebSocketConnection::new("/chat", &config());
        connection.set_state(ConnectionState::Open).await;
        drop(rx);

        assert!(matches!(
            connection.send_text("x").await,
            Err(WebSocketError::ConnectionClosed)
        ));
        assert_eq!(connection.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_state_updates_are_monotonic() {
        let (connection, _rx) = WebSocketConnection::new("/chat", &config());
        connection.set_state(ConnectionState::Closing).await;
        connection.set_state(ConnectionState::Open).await;
        assert_eq!(connection.state().await, ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_stalled_write_yields_to_terminate() {
        let terminate = CancellationToken::new();
        let mut deadline = None;
        let canceller = terminate.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = interruptible(std::future::pending::<()>(), &terminate, &mut deadline).await;
        assert_eq!(outcome, Err(Interrupted::Terminated));
    }

    #[tokio::test]
    async fn test_stalled_write_yields_to_close_deadline() {
        let terminate = CancellationToken::new();
        let mut deadline = Some(Box::pin(time::sleep(Duration::from_millis(20))));

        let outcome = interruptible(std::future::pending::<()>(), &terminate, &mut deadline).await;
        assert_eq!(outcome, Err(Interrupted::CloseTimeout));
    }

    #[tokio::test]
    async fn test_completed_write_is_returned() {
        let terminate = CancellationToken::new();
        let mut deadline = None;
        assert_eq!(interruptible(async { 7 }, &terminate, &mut deadline).await, Ok(7));
    }

    #[tokio::test]
    async fn test_emit_wraps_envelope() {
        let (connection, mut rx) = WebSocketConnection::new("/chat", &WebSocketConfig::default());
        connection.set_state(ConnectionState::Open).await;

        connection
            .emit("greeting", serde_json::json!({"name": "ada"}))
            .await
            .unwrap();

        match rx.recv().await {
            Some(Outbound::Message(WebSocketMessage::Text(text))) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["event"], "greeting");
                assert_eq!(value["data"]["name"], "ada");
            }
            other => panic!("unexpected outbound command: {:?}", other),
        }
    }
}
