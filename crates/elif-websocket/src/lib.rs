//! # elif-websocket
//!
//! Real-time WebSocket gateway engine for the elif.rs LLM-friendly web framework.
//!
//! This crate provides:
//! - RFC 6455 framing with fragmentation, masking and reassembly
//! - An explicit per-connection lifecycle state machine
//! - NestJS-style gateways: `{event, data}` envelopes routed to handlers by path
//! - A connection registry with fault-tolerant broadcast
//! - Bounded outbound queues and graceful shutdown
//!
//! ```rust,no_run
//! use elif_websocket::{Gateway, GatewayContext, HandlerError, WebSocketServer};
//! use serde_json::Value;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = WebSocketServer::builder()
//!     .gateway(
//!         Gateway::builder("/chat")
//!             .on("message", |ctx: GatewayContext, data: Value| async move {
//!                 ctx.broadcast("message", data).await?;
//!                 Ok::<(), HandlerError>(())
//!             })
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server
//!     .serve_with_shutdown(listener, elif_websocket::shutdown_signal())
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Protocol
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod state;

// Connections and dispatch
pub mod connection;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod sse;

// Foundation
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use codec::{FrameCodec, MessageCodec, Role};
pub use config::{ConfigError, WebSocketConfig};
pub use connection::{ConnectionMetadata, ConnectionStats, WebSocketConnection};
pub use error::{HandlerError, WebSocketError, WebSocketResult};
pub use frame::{Frame, OpCode};
pub use gateway::{
    BinaryHandler, DispatchOutcome, EventHandler, Gateway, GatewayBuilder, GatewayContext,
    GatewayRegistry, LifecycleHook, MessageEnvelope,
};
pub use handshake::{accept_key, negotiate, UpgradeRequest};
pub use logging::{init_logging, LoggingConfig};
pub use registry::{BroadcastResult, CloseAllResult, ConnectionEvent, ConnectionRegistry, RegistryStats};
pub use server::{shutdown_signal, WebSocketServer, WebSocketServerBuilder};
pub use sse::{SseEvent, SseStream};
pub use state::{Action, ConnectionStateMachine};
pub use types::{CloseCode, CloseFrame, ConnectionId, ConnectionState, MessageType, WebSocketMessage};
