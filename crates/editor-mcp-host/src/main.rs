//! Editor MCP host binary
//!
//! Serves the demo scene tools to the bridge server over WebSocket.
//! Connects once at startup; reconnecting is a manual `connect` typed on
//! stdin.

use anyhow::Result;
use editor_mcp_host::{ConnectionManager, HostConfig, SceneTools, StatusEvent, ToolEngine};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command line arguments
    let mut config = HostConfig::from_env();
    if let Some(url) = std::env::args().nth(1) {
        config.url = url;
    }

    let engine = ToolEngine::builder()
        .provider(Arc::new(SceneTools::new("Main")))
        .build();
    let table = engine.discover();
    info!("Editor MCP host starting with {} tools", table.len());

    let manager = ConnectionManager::new(config, Arc::new(engine));
    let mut events = manager.subscribe();

    if let Err(e) = manager.connect().await {
        warn!("Not connected: {} (type 'connect' to retry)", e);
    }

    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(StatusEvent { event, status }) => {
                    info!(event = event.name(), state = ?status.state, "Connection status changed");
                    if status.is_disconnected() {
                        let reason = status.disconnect_reason.unwrap_or_default();
                        info!("Disconnected: {} (type 'connect' to reconnect)", reason);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} status events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = commands.next_line() => match line?.as_deref().map(str::trim) {
                None | Some("quit") => break,
                Some("connect") => {
                    if let Err(e) = manager.connect().await {
                        warn!("Connect failed: {}", e);
                    }
                }
                Some("disconnect") => manager.disconnect().await,
                Some("status") => {
                    let status = manager.status();
                    info!(
                        state = ?status.state,
                        error = ?status.last_error,
                        reason = ?status.disconnect_reason,
                        "Current status"
                    );
                }
                Some("") => {}
                Some(other) => warn!("Unknown command '{}' (connect, disconnect, status, quit)", other),
            },
        }
    }

    info!("Editor MCP host shutting down");
    manager.disconnect().await;
    Ok(())
}
