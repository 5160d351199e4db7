//! Chat gateway demo
//!
//! Run with `cargo run -p elif-websocket --example chat_gateway`, then connect
//! with any WebSocket client to `ws://127.0.0.1:8080/chat` and send
//! `{"event": "join", "data": {"name": "ada"}}`.

use elif_websocket::{
    init_logging, shutdown_signal, Gateway, GatewayContext, HandlerError, LoggingConfig,
    WebSocketConfig, WebSocketResult, WebSocketServer,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Deserialize)]
struct Join {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Say {
    text: String,
}

fn chat_gateway() -> WebSocketResult<Gateway> {
    Gateway::builder("/chat")
        .on_connect(|ctx: GatewayContext| async move {
            ctx.emit("welcome", json!({ "id": ctx.connection_id().to_string() }))
                .await?;
            Ok::<(), HandlerError>(())
        })
        .on("join", |ctx: GatewayContext, data: Value| async move {
            let join: Join = serde_json::from_value(data)?;
            ctx.connection()
                .set_metadata("name".to_string(), join.name.clone())
                .await;
            ctx.broadcast_except("joined", json!({ "name": join.name }), ctx.connection_id())
                .await?;
            Ok::<(), HandlerError>(())
        })
        .on("say", |ctx: GatewayContext, data: Value| async move {
            let say: Say = serde_json::from_value(data)?;
            let name = ctx
                .connection()
                .metadata()
                .await
                .custom
                .get("name")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let result = ctx
                .broadcast("said", json!({ "name": name, "text": say.text }))
                .await?;
            if result.has_failures() {
                info!(failed = result.failed_connections.len(), "Some clients missed a message");
            }
            Ok::<(), HandlerError>(())
        })
        .on_binary(|ctx: GatewayContext, data: Vec<u8>| async move {
            ctx.send_binary(data).await?;
            Ok::<(), HandlerError>(())
        })
        .on_disconnect(|ctx: GatewayContext| async move {
            info!(connection_id = %ctx.connection_id(), "Chat member left");
            Ok::<(), HandlerError>(())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LoggingConfig::development())?;

    let config = WebSocketConfig::from_env()?;
    let gateway = chat_gateway()?;
    let server = WebSocketServer::builder()
        .config(config)
        .gateway(gateway)
        .build()?;

    let listener = TcpListener::bind("127.0.0.1:8080").await?;
    let result = server
        .serve_with_shutdown(listener, shutdown_signal())
        .await?;
    info!(
        closed = result.closed_count,
        terminated = result.terminated_count,
        "Chat server stopped"
    );
    Ok(())
}
