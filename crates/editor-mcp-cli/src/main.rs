//! Editor MCP server
//!
//! Speaks MCP JSON-RPC to the agent on stdio and accepts editor hosts on a
//! WebSocket listener (default ws://127.0.0.1:8080/ws).
//!
//! Usage: `editor-mcp-server [bind_addr] [path]`

use anyhow::Result;
use editor_mcp_server::{BridgeServer, ServerConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout belongs to MCP
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command line arguments
    let mut config = ServerConfig::from_env();
    let mut args = std::env::args().skip(1);
    if let Some(addr) = args.next() {
        config.bind_addr = addr;
    }
    if let Some(path) = args.next() {
        config.path = editor_mcp_server::config::normalize_path(&path);
    }

    info!("Editor MCP server starting");
    info!("Hosts connect to {}", config.url());

    let server = Arc::new(BridgeServer::new(config));
    let listener = server
        .bind_websocket()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start WebSocket listener: {}", e))?;
    let accept_task = listener.spawn();

    server
        .clone()
        .run_stdio()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    accept_task.abort();
    let stats = server.dispatcher().stats();
    info!(
        completed = stats.completed,
        timed_out = stats.timed_out,
        "Editor MCP server shutting down"
    );
    Ok(())
}
