//! WebSocket server: upgrade handling, accept loop and graceful shutdown

use crate::codec::MessageCodec;
use crate::config::WebSocketConfig;
use crate::connection::{ConnectionDriver, WebSocketConnection};
use crate::error::{WebSocketError, WebSocketResult};
use crate::gateway::{Gateway, GatewayRegistry};
use crate::handshake::{
    negotiate, read_upgrade_request, write_handshake_response, write_rejection, UpgradeRequest,
};
use crate::registry::{BroadcastResult, CloseAllResult, ConnectionRegistry, RegistryStats};
use crate::types::{CloseCode, CloseFrame, ConnectionId, ConnectionState, WebSocketMessage};
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::{signal, time};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// WebSocket server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct WebSocketServer {
    registry: Arc<ConnectionRegistry>,
    gateways: Arc<GatewayRegistry>,
    config: Arc<WebSocketConfig>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    pub fn new() -> Self {
        Self::from_validated(WebSocketConfig::default())
    }

    /// Create a server with a custom configuration, rejecting invalid settings
    pub fn with_config(config: WebSocketConfig) -> WebSocketResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: WebSocketConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            gateways: Arc::new(GatewayRegistry::new()),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn builder() -> WebSocketServerBuilder {
        WebSocketServerBuilder::new()
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn gateways(&self) -> Arc<GatewayRegistry> {
        self.gateways.clone()
    }

    /// Bind a gateway to its path; fails if the path is already bound
    pub fn register_gateway(&self, gateway: Gateway) -> WebSocketResult<()> {
        self.gateways.register(gateway).map(|_| ())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Complete an upgrade handed over by a router.
    ///
    /// The request head has already been consumed from `stream`. On failure
    /// an HTTP error response is written and no connection is created.
    pub async fn handle_upgrade<S>(&self, request: UpgradeRequest, stream: S) -> WebSocketResult<ConnectionId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.upgrade(request, stream, BytesMut::new()).await
    }

    /// Read the upgrade request off a raw stream and complete the handshake
    pub async fn accept_stream<S>(
        &self,
        mut stream: S,
        remote_addr: Option<SocketAddr>,
    ) -> WebSocketResult<ConnectionId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let read = time::timeout(self.config.handshake_timeout(), read_upgrade_request(&mut stream)).await;
        let (mut request, leftover) = match read {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(err)) => {
                if matches!(err, WebSocketError::Handshake(_)) {
                    reject(&mut stream, 400, "Bad Request", &err).await;
                }
                return Err(err);
            }
            Err(_) => {
                return Err(WebSocketError::handshake(
                    "timed out waiting for the upgrade request",
                ))
            }
        };

        if request.remote_addr.is_none() {
            request.remote_addr = remote_addr;
        }
        self.upgrade(request, stream, leftover).await
    }

    /// Accept TCP connections until [`shutdown`](Self::shutdown) is called
    pub async fn serve(&self, listener: TcpListener) -> WebSocketResult<()> {
        match listener.local_addr() {
            Ok(addr) => info!("WebSocket server listening on {}", addr),
            Err(_) => info!("WebSocket server listening"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Stopped accepting WebSocket connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("Failed to accept TCP connection: {}", err);
                            continue;
                        }
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.accept_stream(stream, Some(addr)).await {
                            debug!(remote_addr = %addr, "Upgrade not completed: {}", err);
                        }
                    });
                }
            }
        }
    }

    /// Serve until `signal` resolves, then shut down gracefully
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> WebSocketResult<CloseAllResult>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve(listener) => result?,
            _ = signal => {}
        }
        Ok(self.shutdown().await)
    }

    pub async fn broadcast(&self, message: WebSocketMessage) -> BroadcastResult {
        self.registry.broadcast(message, None).await
    }

    pub async fn broadcast_text<T: Into<String>>(&self, text: T) -> BroadcastResult {
        self.registry.broadcast_text(text).await
    }

    pub async fn send_to_connection(&self, id: ConnectionId, message: WebSocketMessage) -> WebSocketResult<()> {
        self.registry.send_to_connection(id, message).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Stop accepting, send Close(1001) to every connection and wait up to
    /// `shutdown_timeout` for them to finish before force-closing the rest.
    pub async fn shutdown(&self) -> CloseAllResult {
        let connections = self.registry.connection_count().await;
        info!(connections, "Shutting down WebSocket server");
        self.shutdown.cancel();

        let mut result = self
            .registry
            .close_all_connections(CloseFrame::new(CloseCode::GoingAway, "server shutting down"))
            .await;

        if !self
            .registry
            .wait_until_empty(self.config.shutdown_timeout())
            .await
        {
            result.terminated_count = self.registry.terminate_all().await;
        }

        info!(
            closed = result.closed_count,
            terminated = result.terminated_count,
            "WebSocket server shut down"
        );
        result
    }

    async fn upgrade<S>(&self, request: UpgradeRequest, mut stream: S, leftover: BytesMut) -> WebSocketResult<ConnectionId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_shutting_down() {
            let err = WebSocketError::handshake("server is shutting down");
            reject(&mut stream, 503, "Service Unavailable", &err).await;
            return Err(err);
        }

        let Some(gateway) = self.gateways.resolve(&request.path) else {
            let err = WebSocketError::GatewayNotFound(request.path.clone());
            warn!(path = %request.path, "Upgrade requested for unregistered path");
            reject(&mut stream, 404, "Not Found", &err).await;
            return Err(err);
        };

        let accept = match negotiate(&request) {
            Ok(accept) => accept,
            Err(err) => {
                warn!(path = %request.path, "Rejecting upgrade: {}", err);
                reject(&mut stream, 400, "Bad Request", &err).await;
                return Err(err);
            }
        };

        write_handshake_response(&mut stream, &accept).await?;

        let (connection, outbound) = WebSocketConnection::new(gateway.path(), &self.config);
        connection
            .set_peer_info(
                request.remote_addr.map(|addr| addr.to_string()),
                request.header("user-agent").map(str::to_string),
            )
            .await;
        connection.set_state(ConnectionState::Open).await;
        let id = self.registry.add_connection(connection.clone()).await;

        let mut parts = FramedParts::new::<WebSocketMessage>(stream, MessageCodec::server(&self.config));
        parts.read_buf = leftover;
        let framed = Framed::from_parts(parts);

        info!(connection_id = %id, path = %gateway.path(), "WebSocket connection established");
        let driver = ConnectionDriver::new(
            connection,
            framed,
            outbound,
            gateway,
            self.registry.clone(),
            self.config.clone(),
        );
        tokio::spawn(driver.run());

        Ok(id)
    }
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn reject<S>(stream: &mut S, status: u16, reason: &str, err: &WebSocketError)
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{}\n", err);
    if let Err(write_err) = write_rejection(stream, status, reason, &body).await {
        debug!("Failed to write {} response: {}", status, write_err);
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => warn!("Received terminate signal, shutting down gracefully"),
    }
}

/// Builder for [`WebSocketServer`]
#[derive(Default)]
pub struct WebSocketServerBuilder {
    config: WebSocketConfig,
    gateways: Vec<Gateway>,
}

impl WebSocketServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn outbound_fragment_size(mut self, size: usize) -> Self {
        self.config.outbound_fragment_size = Some(size);
        self
    }

    pub fn auto_pong(mut self, enabled: bool) -> Self {
        self.config.auto_pong = enabled;
        self
    }

    pub fn ping_interval(mut self, seconds: u64) -> Self {
        self.config.ping_interval_secs = Some(seconds);
        self
    }

    pub fn no_ping(mut self) -> Self {
        self.config.ping_interval_secs = None;
        self
    }

    pub fn close_timeout(mut self, seconds: u64) -> Self {
        self.config.close_timeout_secs = seconds;
        self
    }

    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.config.shutdown_timeout_secs = seconds;
        self
    }

    pub fn gateway(mut self, gateway: Gateway) -> Self {
        self.gateways.push(gateway);
        self
    }

    /// Validate the configuration and register every gateway
    pub fn build(self) -> WebSocketResult<WebSocketServer> {
        let server = WebSocketServer::with_config(self.config)?;
        for gateway in self.gateways {
            server.register_gateway(gateway)?;
        }
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayContext;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn chat_gateway() -> Gateway {
        Gateway::builder("/chat")
            .on("echo", |ctx: GatewayContext, data: Value| async move {
                ctx.emit("echo", data).await?;
                Ok::<(), crate::error::HandlerError>(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_duplicate_gateways() {
        let result = WebSocketServer::builder()
            .gateway(chat_gateway())
            .gateway(chat_gateway())
            .build();
        assert!(matches!(result, Err(WebSocketError::DuplicateGateway(_))));
    }

    #[test]
    fn test_builder_validates_config() {
        let result = WebSocketServer::builder().max_message_size(0).build();
        assert!(matches!(result, Err(WebSocketError::Config(_))));
    }

    #[test]
    fn test_with_config_rejects_invalid_limits() {
        let result = WebSocketServer::with_config(WebSocketConfig {
            max_pending_messages: 0,
            ..WebSocketConfig::default()
        });
        assert!(matches!(result, Err(WebSocketError::Config(_))));

        let result = WebSocketServer::with_config(WebSocketConfig {
            outbound_fragment_size: Some(0),
            ..WebSocketConfig::default()
        });
        assert!(matches!(result, Err(WebSocketError::Config(_))));
    }

    #[test]
    fn test_builder_applies_settings() {
        let server = WebSocketServer::builder()
            .max_frame_size(1024)
            .no_ping()
            .close_timeout(1)
            .build()
            .unwrap();
        assert_eq!(server.config().max_frame_size, 1024);
        assert_eq!(server.config().ping_interval_secs, None);
        assert_eq!(server.config().close_timeout_secs, 1);
    }

    async fn response_for(
        server: &WebSocketServer,
        request: &[u8],
    ) -> (WebSocketResult<ConnectionId>, String, tokio::io::DuplexStream) {
        let (mut client, stream) = tokio::io::duplex(4096);
        client.write_all(request).await.unwrap();
        let result = server.accept_stream(stream, None).await;

        let mut response = vec![0u8; 4096];
        let n = client.read(&mut response).await.unwrap();
        (result, String::from_utf8_lossy(&response[..n]).into_owned(), client)
    }

    #[tokio::test]
    async fn test_unregistered_path_gets_404() {
        let server = WebSocketServer::new();
        server.register_gateway(chat_gateway()).unwrap();

        let (result, response, _client) = response_for(
            &server,
            b"GET /news HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await;

        assert!(matches!(result, Err(WebSocketError::GatewayNotFound(_))));
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_handshake_gets_400() {
        let server = WebSocketServer::new();
        server.register_gateway(chat_gateway()).unwrap();

        let (result, response, _client) = response_for(
            &server,
            b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await;

        assert!(matches!(result, Err(WebSocketError::Handshake(_))));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_successful_upgrade_registers_connection() {
        let server = WebSocketServer::new();
        server.register_gateway(chat_gateway()).unwrap();

        let (result, response, _client) = response_for(
            &server,
            b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
              User-Agent: test-client\r\n\r\n",
        )
        .await;

        let id = result.unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let connection = server.registry().get_connection(id).await.unwrap();
        assert_eq!(connection.path(), "/chat");
        assert_eq!(
            connection.metadata().await.user_agent.as_deref(),
            Some("test-client")
        );
    }

    #[tokio::test]
    async fn test_upgrade_refused_after_shutdown() {
        let server = WebSocketServer::new();
        server.register_gateway(chat_gateway()).unwrap();
        server.shutdown().await;

        let (result, response, _client) = response_for(
            &server,
            b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await;

        assert!(result.is_err());
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }
}
