//! Gateways: namespace-bound event handler tables
//!
//! A [`Gateway`] binds a path (e.g. `/chat`) to a table of
//! `event name -> handler` built once with [`GatewayBuilder`]. Text messages
//! are parsed as `{"event": string, "data": any}` envelopes and routed by
//! event name; binary messages go to an optional binary handler.
//!
//! ```rust,no_run
//! use elif_websocket::{Gateway, GatewayContext, HandlerError};
//! use serde_json::Value;
//!
//! let gateway = Gateway::builder("/chat")
//!     .on("message", |ctx: GatewayContext, data: Value| async move {
//!         ctx.broadcast("message", data).await?;
//!         Ok::<(), HandlerError>(())
//!     })
//!     .build()
//!     .unwrap();
//! ```

use crate::connection::WebSocketConnection;
use crate::error::{HandlerError, WebSocketError, WebSocketResult};
use crate::registry::{BroadcastResult, ConnectionRegistry};
use crate::types::{CloseCode, ConnectionId, WebSocketMessage};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Application envelope carried inside Text messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl MessageEnvelope {
    pub fn new<E: Into<String>>(event: E, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn from_json(text: &str) -> WebSocketResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> WebSocketResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What handlers get access to while processing a message
#[derive(Clone, Debug)]
pub struct GatewayContext {
    connection: WebSocketConnection,
    registry: Arc<ConnectionRegistry>,
    event: Option<String>,
}

impl GatewayContext {
    pub fn new(connection: WebSocketConnection, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            connection,
            registry,
            event: None,
        }
    }

    fn for_event(&self, event: &str) -> Self {
        Self {
            event: Some(event.to_string()),
            ..self.clone()
        }
    }

    /// Name of the event being handled, `None` in hooks and binary handlers
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn connection(&self) -> &WebSocketConnection {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn path(&self) -> &str {
        self.connection.path()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Reply to the current connection with an event envelope
    pub async fn emit<T: Serialize>(&self, event: &str, data: T) -> WebSocketResult<()> {
        self.connection.emit(event, data).await
    }

    pub async fn send_text<T: Into<String>>(&self, text: T) -> WebSocketResult<()> {
        self.connection.send_text(text).await
    }

    pub async fn send_binary<T: Into<Vec<u8>>>(&self, data: T) -> WebSocketResult<()> {
        self.connection.send_binary(data).await
    }

    /// Emit an event to every open connection on this gateway's path
    pub async fn broadcast<T: Serialize>(&self, event: &str, data: T) -> WebSocketResult<BroadcastResult> {
        self.broadcast_envelope(event, data, None).await
    }

    /// Emit an event to every open connection on this gateway's path except `exclude`
    pub async fn broadcast_except<T: Serialize>(
        &self,
        event: &str,
        data: T,
        exclude: ConnectionId,
    ) -> WebSocketResult<BroadcastResult> {
        self.broadcast_envelope(event, data, Some(exclude)).await
    }

    pub async fn close(&self, code: CloseCode, reason: &str) -> WebSocketResult<()> {
        self.connection.close_with_reason(code, reason).await
    }

    async fn broadcast_envelope<T: Serialize>(
        &self,
        event: &str,
        data: T,
        exclude: Option<ConnectionId>,
    ) -> WebSocketResult<BroadcastResult> {
        let text = MessageEnvelope::new(event, serde_json::to_value(data)?).to_json()?;
        Ok(self
            .registry
            .broadcast_to_path(self.path(), WebSocketMessage::Text(text), exclude)
            .await)
    }
}

/// Handler for one event name
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: GatewayContext, data: Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(GatewayContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: GatewayContext, data: Value) -> Result<(), HandlerError> {
        (self)(ctx, data).await
    }
}

/// Handler for binary messages, which bypass envelope parsing
#[async_trait]
pub trait BinaryHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: GatewayContext, data: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> BinaryHandler for F
where
    F: Fn(GatewayContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: GatewayContext, data: Vec<u8>) -> Result<(), HandlerError> {
        (self)(ctx, data).await
    }
}

/// Connect/disconnect hook
#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    async fn call(&self, ctx: GatewayContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> LifecycleHook for F
where
    F: Fn(GatewayContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: GatewayContext) -> Result<(), HandlerError> {
        (self)(ctx).await
    }
}

/// Result of dispatching one message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled,
    /// The handler returned an error or panicked; the connection stays open
    Failed(HandlerError),
    /// No handler is registered for the event; the message is dropped
    UnknownEvent(String),
    /// The text was not a valid `{event, data}` envelope
    MalformedEnvelope,
    /// Binary message on a gateway without a binary handler
    NoBinaryHandler,
    /// Control messages never reach gateways
    Ignored,
}

/// A namespace-bound event handler table
pub struct Gateway {
    path: String,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    binary_handler: Option<Arc<dyn BinaryHandler>>,
    on_connect: Option<Arc<dyn LifecycleHook>>,
    on_disconnect: Option<Arc<dyn LifecycleHook>>,
}

impl Gateway {
    pub fn builder<P: Into<String>>(path: P) -> GatewayBuilder {
        GatewayBuilder::new(path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registered event names, sorted
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Route one reassembled message to its handler.
    ///
    /// Handler failures are logged and reported in the outcome; they never
    /// propagate to the connection.
    pub async fn dispatch(&self, ctx: &GatewayContext, message: WebSocketMessage) -> DispatchOutcome {
        let connection_id = ctx.connection_id();

        match message {
            WebSocketMessage::Text(text) => {
                let envelope = match MessageEnvelope::from_json(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(%connection_id, path = %self.path, "Dropping malformed message envelope: {}", err);
                        return DispatchOutcome::MalformedEnvelope;
                    }
                };

                let Some(handler) = self.handlers.get(&envelope.event) else {
                    debug!(%connection_id, path = %self.path, event = %envelope.event, "No handler for event, dropping message");
                    return DispatchOutcome::UnknownEvent(envelope.event);
                };

                match guarded(handler.handle(ctx.for_event(&envelope.event), envelope.data)).await {
                    Ok(()) => DispatchOutcome::Handled,
                    Err(err) => {
                        error!(%connection_id, path = %self.path, event = %envelope.event, "Gateway handler failed: {}", err);
                        DispatchOutcome::Failed(err)
                    }
                }
            }
            WebSocketMessage::Binary(data) => {
                let Some(handler) = &self.binary_handler else {
                    debug!(%connection_id, path = %self.path, "No binary handler, dropping message");
                    return DispatchOutcome::NoBinaryHandler;
                };

                match guarded(handler.handle(ctx.clone(), data)).await {
                    Ok(()) => DispatchOutcome::Handled,
                    Err(err) => {
                        error!(%connection_id, path = %self.path, "Binary handler failed: {}", err);
                        DispatchOutcome::Failed(err)
                    }
                }
            }
            _ => DispatchOutcome::Ignored,
        }
    }

    pub(crate) async fn connected(&self, ctx: &GatewayContext) {
        info!(connection_id = %ctx.connection_id(), path = %self.path, "Client connected");
        if let Some(hook) = &self.on_connect {
            if let Err(err) = guarded(hook.call(ctx.clone())).await {
                error!(connection_id = %ctx.connection_id(), path = %self.path, "Connect hook failed: {}", err);
            }
        }
    }

    pub(crate) async fn disconnected(&self, ctx: &GatewayContext) {
        info!(connection_id = %ctx.connection_id(), path = %self.path, "Client disconnected");
        if let Some(hook) = &self.on_disconnect {
            if let Err(err) = guarded(hook.call(ctx.clone())).await {
                error!(connection_id = %ctx.connection_id(), path = %self.path, "Disconnect hook failed: {}", err);
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("path", &self.path)
            .field("events", &self.events())
            .field("binary", &self.binary_handler.is_some())
            .finish()
    }
}

// Panics inside handlers are reported like returned errors.
async fn guarded<F>(future: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    path: String,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    binary_handler: Option<Arc<dyn BinaryHandler>>,
    on_connect: Option<Arc<dyn LifecycleHook>>,
    on_disconnect: Option<Arc<dyn LifecycleHook>>,
}

impl GatewayBuilder {
    pub fn new<P: Into<String>>(path: P) -> Self {
        Self {
            path: path.into(),
            handlers: HashMap::new(),
            binary_handler: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Register a closure for an event. A later registration for the same
    /// event replaces the earlier one.
    pub fn on<F, Fut>(self, event: &str, handler: F) -> Self
    where
        F: Fn(GatewayContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_handler(event, handler)
    }

    /// Register any [`EventHandler`] implementation for an event
    pub fn on_handler<H: EventHandler>(mut self, event: &str, handler: H) -> Self {
        if self.handlers.insert(event.to_string(), Arc::new(handler)).is_some() {
            warn!(path = %self.path, event, "Replacing existing handler");
        }
        self
    }

    pub fn on_binary<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(GatewayContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.binary_handler = Some(Arc::new(handler));
        self
    }

    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(GatewayContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(GatewayContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> WebSocketResult<Gateway> {
        if !self.path.starts_with('/') {
            return Err(WebSocketError::InvalidGatewayPath(self.path));
        }

        Ok(Gateway {
            path: normalize_path(&self.path).to_string(),
            handlers: self.handlers,
            binary_handler: self.binary_handler,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
        })
    }
}

/// Path -> gateway bindings. Each path may be bound at most once.
#[derive(Default)]
pub struct GatewayRegistry {
    gateways: RwLock<HashMap<String, Arc<Gateway>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gateway: Gateway) -> WebSocketResult<Arc<Gateway>> {
        let mut gateways = self.gateways.write().unwrap_or_else(|e| e.into_inner());
        let path = gateway.path().to_string();
        if gateways.contains_key(&path) {
            return Err(WebSocketError::DuplicateGateway(path));
        }

        let gateway = Arc::new(gateway);
        gateways.insert(path.clone(), gateway.clone());
        info!(path = %path, events = ?gateway.events(), "Registered gateway");
        Ok(gateway)
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<Gateway>> {
        let gateways = self.gateways.read().unwrap_or_else(|e| e.into_inner());
        gateways.get(normalize_path(path)).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let gateways = self.gateways.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = gateways.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.gateways.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
