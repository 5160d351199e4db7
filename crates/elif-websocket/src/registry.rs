//! Connection registry for managing open WebSocket connections

use crate::connection::WebSocketConnection;
use crate::error::{WebSocketError, WebSocketResult};
use crate::types::{CloseFrame, ConnectionId, ConnectionState, WebSocketMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// Events that can occur in the connection registry
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// New connection was added
    Connected(ConnectionId),
    /// Connection was removed
    Disconnected(ConnectionId),
    /// Message was broadcast; carries the number of recipients reached
    Broadcast { recipients: usize },
}

type EventHandlerFn = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Set of all open connections, owned by the server and shared by handle
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, WebSocketConnection>>,
    event_handlers: RwLock<Vec<EventHandlerFn>>,
    emptied: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(Vec::new()),
            emptied: Notify::new(),
        }
    }

    /// Add a connection to the registry
    pub async fn add_connection(&self, connection: WebSocketConnection) -> ConnectionId {
        let id = connection.id;
        let path = connection.path().to_string();
        self.connections.write().await.insert(id, connection);

        info!(connection_id = %id, path = %path, "Added connection to registry");
        self.emit_event(ConnectionEvent::Connected(id)).await;
        id
    }

    /// Remove a connection from the registry
    pub async fn remove_connection(&self, id: ConnectionId) -> Option<WebSocketConnection> {
        let (connection, now_empty) = {
            let mut connections = self.connections.write().await;
            let connection = connections.remove(&id);
            (connection, connections.is_empty())
        };

        if connection.is_some() {
            info!(connection_id = %id, "Removed connection from registry");
            self.emit_event(ConnectionEvent::Disconnected(id)).await;
        }
        if now_empty {
            self.emptied.notify_waiters();
        }
        connection
    }

    pub async fn get_connection(&self, id: ConnectionId) -> Option<WebSocketConnection> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn get_all_connections(&self) -> Vec<WebSocketConnection> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn get_connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a message to a specific connection
    pub async fn send_to_connection(
        &self,
        id: ConnectionId,
        message: WebSocketMessage,
    ) -> WebSocketResult<()> {
        let connection = self
            .get_connection(id)
            .await
            .ok_or(WebSocketError::ConnectionNotFound(id))?;
        connection.send(message).await
    }

    pub async fn send_text_to_connection<T: Into<String>>(
        &self,
        id: ConnectionId,
        text: T,
    ) -> WebSocketResult<()> {
        self.send_to_connection(id, WebSocketMessage::text(text)).await
    }

    /// Broadcast a message to every open connection except `exclude`.
    ///
    /// A failed send is recorded in the result and delivery continues with
    /// the remaining connections.
    pub async fn broadcast(
        &self,
        message: WebSocketMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastResult {
        let connections = self.get_all_connections().await;
        self.deliver(connections, message, exclude).await
    }

    pub async fn broadcast_text<T: Into<String>>(&self, text: T) -> BroadcastResult {
        self.broadcast(WebSocketMessage::text(text), None).await
    }

    pub async fn broadcast_binary<T: Into<Vec<u8>>>(&self, data: T) -> BroadcastResult {
        self.broadcast(WebSocketMessage::binary(data), None).await
    }

    /// Broadcast to open connections bound to one gateway path
    pub async fn broadcast_to_path(
        &self,
        path: &str,
        message: WebSocketMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastResult {
        let connections: Vec<WebSocketConnection> = self
            .get_all_connections()
            .await
            .into_iter()
            .filter(|connection| connection.path() == path)
            .collect();
        self.deliver(connections, message, exclude).await
    }

    async fn deliver(
        &self,
        connections: Vec<WebSocketConnection>,
        message: WebSocketMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastResult {
        let mut results = BroadcastResult::new();

        for connection in connections {
            if Some(connection.id) == exclude {
                continue;
            }
            if !connection.is_active().await {
                results.inactive_connections.push(connection.id);
                continue;
            }
            match connection.send(message.clone()).await {
                Ok(()) => results.success_count += 1,
                Err(err) => {
                    warn!(connection_id = %connection.id, "Broadcast delivery failed: {}", err);
                    results.failed_connections.push((connection.id, err));
                }
            }
        }

        debug!(
            recipients = results.success_count,
            failed = results.failed_connections.len(),
            "Broadcast complete"
        );
        self.emit_event(ConnectionEvent::Broadcast {
            recipients: results.success_count,
        })
        .await;
        results
    }

    /// Start the closing handshake on every registered connection.
    ///
    /// Connections leave the registry once their driver reaches `Closed`.
    pub async fn close_all_connections(&self, frame: CloseFrame) -> CloseAllResult {
        let mut results = CloseAllResult::new();

        for connection in self.get_all_connections().await {
            match connection
                .close_with_reason(frame.code, frame.reason.clone())
                .await
            {
                Ok(()) => results.closed_count += 1,
                Err(err) => results.failed_connections.push((connection.id, err)),
            }
        }

        info!(
            closed = results.closed_count,
            failed = results.failed_connections.len(),
            "Sent close to all connections"
        );
        results
    }

    /// Drop every remaining socket without a closing handshake
    pub async fn terminate_all(&self) -> usize {
        let connections = self.get_all_connections().await;
        for connection in &connections {
            connection.terminate();
        }
        if !connections.is_empty() {
            warn!(count = connections.len(), "Force-closed remaining connections");
        }
        connections.len()
    }

    /// Wait until the registry is empty or `timeout` elapses.
    ///
    /// Returns `true` when the registry drained in time.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.connections.read().await.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let connections = self.get_all_connections().await;
        let mut stats = RegistryStats {
            total_connections: connections.len(),
            ..RegistryStats::default()
        };

        for connection in connections {
            match connection.state().await {
                ConnectionState::Open => stats.active_connections += 1,
                ConnectionState::Connecting => stats.connecting_connections += 1,
                ConnectionState::Closing => stats.closing_connections += 1,
                ConnectionState::Closed => stats.closed_connections += 1,
            }

            let conn_stats = connection.stats().await;
            stats.total_messages_sent += conn_stats.messages_sent;
            stats.total_messages_received += conn_stats.messages_received;
            stats.total_bytes_sent += conn_stats.bytes_sent;
            stats.total_bytes_received += conn_stats.bytes_received;
        }

        stats
    }

    /// Subscribe to registry events
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.write().await.push(Box::new(handler));
    }

    async fn emit_event(&self, event: ConnectionEvent) {
        let handlers = self.event_handlers.read().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

/// Result of broadcasting a message to multiple connections
#[derive(Debug)]
pub struct BroadcastResult {
    pub success_count: usize,
    pub failed_connections: Vec<(ConnectionId, WebSocketError)>,
    pub inactive_connections: Vec<ConnectionId>,
}

impl BroadcastResult {
    fn new() -> Self {
        Self {
            success_count: 0,
            failed_connections: Vec::new(),
            inactive_connections: Vec::new(),
        }
    }

    pub fn total_attempted(&self) -> usize {
        self.success_count + self.failed_connections.len() + self.inactive_connections.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_connections.is_empty()
    }
}

/// Result of closing all connections
#[derive(Debug)]
pub struct CloseAllResult {
    pub closed_count: usize,
    pub failed_connections: Vec<(ConnectionId, WebSocketError)>,
    /// Connections still open after the grace period and dropped without a handshake
    pub terminated_count: usize,
}

impl CloseAllResult {
    fn new() -> Self {
        Self {
            closed_count: 0,
            failed_connections: Vec::new(),
            terminated_count: 0,
        }
    }
}

/// Registry statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub connecting_connections: usize,
    pub closing_connections: usize,
    pub closed_connections: usize,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebSocketConfig;
    use crate::connection::Outbound;
    use crate::types::CloseCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn open_connection(path: &str) -> (WebSocketConnection, mpsc::Receiver<Outbound>) {
        let (connection, rx) = WebSocketConnection::new(path, &WebSocketConfig::default());
        connection.set_state(ConnectionState::Open).await;
        (connection, rx)
    }

    fn expect_text(rx: &mut mpsc::Receiver<Outbound>, expected: &str) {
        match rx.try_recv() {
            Ok(Outbound::Message(message)) => assert_eq!(message, WebSocketMessage::text(expected)),
            other => panic!("unexpected outbound command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = ConnectionRegistry::new();
        let (connection, _rx) = open_connection("/chat").await;
        let id = registry.add_connection(connection).await;

        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.get_connection(id).await.is_some());
        assert_eq!(registry.get_connection_ids().await, vec![id]);

        assert!(registry.remove_connection(id).await.is_some());
        assert!(registry.remove_connection(id).await.is_none());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_survives_partial_failure() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = open_connection("/chat").await;
        let (second, second_rx) = open_connection("/chat").await;
        let (third, mut third_rx) = open_connection("/chat").await;
        let failing = second.id;
        registry.add_connection(first).await;
        registry.add_connection(second).await;
        registry.add_connection(third).await;

        // the second connection's driver is gone, so sending to it fails
        drop(second_rx);

        let result = registry.broadcast_text("hello").await;

        assert_eq!(result.success_count, 2);
        assert!(result.has_failures());
        assert_eq!(result.failed_connections.len(), 1);
        assert_eq!(result.failed_connections[0].0, failing);
        assert!(matches!(
            result.failed_connections[0].1,
            WebSocketError::ConnectionClosed
        ));
        expect_text(&mut first_rx, "hello");
        expect_text(&mut third_rx, "hello");
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_skips_inactive() {
        let registry = ConnectionRegistry::new();
        let (sender, mut sender_rx) = open_connection("/chat").await;
        let (peer, mut peer_rx) = open_connection("/chat").await;
        let (closing, _closing_rx) = open_connection("/chat").await;
        closing.set_state(ConnectionState::Closing).await;
        let sender_id = sender.id;
        let closing_id = closing.id;
        registry.add_connection(sender).await;
        registry.add_connection(peer).await;
        registry.add_connection(closing).await;

        let result = registry
            .broadcast(WebSocketMessage::text("hi"), Some(sender_id))
            .await;

        assert_eq!(result.success_count, 1);
        assert_eq!(result.inactive_connections, vec![closing_id]);
        assert_eq!(result.total_attempted(), 2);
        expect_text(&mut peer_rx, "hi");
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_path() {
        let registry = ConnectionRegistry::new();
        let (chat, mut chat_rx) = open_connection("/chat").await;
        let (news, mut news_rx) = open_connection("/news").await;
        registry.add_connection(chat).await;
        registry.add_connection(news).await;

        let result = registry
            .broadcast_to_path("/news", WebSocketMessage::text("headline"), None)
            .await;

        assert_eq!(result.success_count, 1);
        expect_text(&mut news_rx, "headline");
        assert!(chat_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let missing = ConnectionId::new();
        assert!(matches!(
            registry.send_text_to_connection(missing, "x").await,
            Err(WebSocketError::ConnectionNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_close_all_queues_close_frames() {
        let registry = ConnectionRegistry::new();
        let (connection, mut rx) = open_connection("/chat").await;
        registry.add_connection(connection).await;

        let result = registry
            .close_all_connections(CloseFrame::new(CloseCode::GoingAway, "shutdown"))
            .await;

        assert_eq!(result.closed_count, 1);
        match rx.try_recv() {
            Ok(Outbound::Close(frame)) => assert_eq!(frame.code, CloseCode::GoingAway),
            other => panic!("unexpected outbound command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(registry.wait_until_empty(Duration::from_millis(10)).await);

        let (connection, _rx) = open_connection("/chat").await;
        let id = registry.add_connection(connection).await;
        assert!(!registry.wait_until_empty(Duration::from_millis(20)).await);

        let remover = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remover.remove_connection(id).await;
        });
        assert!(registry.wait_until_empty(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_event_handlers() {
        let registry = ConnectionRegistry::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let (c, d) = (connected.clone(), disconnected.clone());
        registry
            .add_event_handler(move |event| match event {
                ConnectionEvent::Connected(_) => {
                    c.fetch_add(1, Ordering::SeqCst);
                }
                ConnectionEvent::Disconnected(_) => {
                    d.fetch_add(1, Ordering::SeqCst);
                }
                ConnectionEvent::Broadcast { .. } => {}
            })
            .await;

        let (connection, _rx) = open_connection("/chat").await;
        let id = registry.add_connection(connection).await;
        registry.remove_connection(id).await;

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = ConnectionRegistry::new();
        let (open, _open_rx) = open_connection("/chat").await;
        let (closing, _closing_rx) = open_connection("/chat").await;
        closing.set_state(ConnectionState::Closing).await;
        registry.add_connection(open).await;
        registry.add_connection(closing).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.closing_connections, 1);
    }
}
