//! # editor-mcp-server
//!
//! Agent-facing half of the editor MCP bridge.
//!
//! This crate provides:
//! - `ConnectionRegistry` tracking live host WebSocket connections
//! - `Dispatcher` correlating tool calls with host replies
//! - MCP JSON-RPC protocol handling on stdio
//! - The WebSocket listener hosts connect to

pub mod config;
pub mod dispatcher;
pub mod mcp;
pub mod registry;
pub mod tools;
pub mod transport;

pub use config::ServerConfig;
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, SendOutcome};
pub use transport::websocket::WebSocketServer;

use editor_mcp_core::Result;
use std::sync::Arc;

/// Bridge server context.
///
/// Owns the connection registry and the dispatcher; built once at the
/// composition root and shared by reference with the transports.
pub struct BridgeServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl BridgeServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), config.request_timeout));
        Self {
            config,
            registry,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the WebSocket listener hosts connect to
    pub async fn bind_websocket(&self) -> Result<WebSocketServer> {
        WebSocketServer::bind(
            &self.config,
            self.registry.clone(),
            self.dispatcher.clone(),
        )
        .await
    }

    /// Run the MCP server on stdio until the client disconnects
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        transport::stdio::run(self).await
    }

    /// Resolve every outstanding tool call with a shutdown error
    pub fn shutdown(&self) -> usize {
        self.dispatcher.shutdown()
    }
}
