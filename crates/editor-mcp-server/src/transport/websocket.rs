//! WebSocket listener for host connections
//!
//! Each accepted host gets a [`WsConnection`] registered in the
//! [`ConnectionRegistry`]. Text frames received on it are replies and go
//! straight to the [`Dispatcher`]. Fragmented messages are reassembled by
//! tungstenite before they reach us.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::{Connection, ConnectionRegistry};
use async_trait::async_trait;
use editor_mcp_core::envelope::preview;
use editor_mcp_core::{BridgeError, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write half of an accepted host WebSocket
pub struct WsConnection {
    peer: SocketAddr,
    open: AtomicBool,
    sink: Mutex<WsSink>,
}

impl WsConnection {
    fn new(peer: SocketAddr, sink: WsSink) -> Self {
        Self {
            peer,
            open: AtomicBool::new(true),
            sink: Mutex::new(sink),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &str) -> Result<()> {
        if !self.is_connected() {
            warn!(peer = %self.peer, "Attempted to send message to disconnected WebSocket");
            return Err(BridgeError::TransportClosed);
        }

        let mut sink = self.sink.lock().await;
        match sink.send(Message::text(message.to_owned())).await {
            Ok(()) => {
                debug!(peer = %self.peer, json = %preview(message), "Message sent to WebSocket");
                Ok(())
            }
            Err(e) => {
                error!(peer = %self.peer, "Failed to send WebSocket message: {}", e);
                self.mark_closed();
                Err(BridgeError::Transport(e.to_string()))
            }
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Listener accepting host WebSocket connections on a fixed path
pub struct WebSocketServer {
    listener: TcpListener,
    path: String,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl WebSocketServer {
    /// Bind the listener; connections are accepted once [`run`](Self::run) is polled
    pub async fn bind(
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            BridgeError::Transport(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;

        Ok(Self {
            listener,
            path: crate::config::normalize_path(&config.path),
            registry,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// URL a host should connect to
    pub fn url(&self) -> Result<String> {
        Ok(format!("ws://{}{}", self.local_addr()?, self.path))
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) {
        match self.url() {
            Ok(url) => info!("WebSocket server listening on {}", url),
            Err(e) => warn!("WebSocket server listening (address unknown: {})", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.path.clone(),
                        self.registry.clone(),
                        self.dispatcher.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Run the accept loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    path: String,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
) {
    let check_path = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some(format!(
                "No WebSocket endpoint at {}",
                request.uri().path()
            )));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, "WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (sink, mut frames) = ws.split();
    let connection = Arc::new(WsConnection::new(peer, sink));
    let id = registry.register(connection.clone());
    info!(peer = %peer, connection_id = %id, "WebSocket connection established");

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                dispatcher.handle_incoming_text(text.as_str());
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    dispatcher.handle_incoming_text(text);
                }
                Err(_) => warn!(peer = %peer, "Discarding non UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(peer = %peer, ?frame, "WebSocket close message received from client");
                break;
            }
            // Ping/pong is answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                error!(peer = %peer, "WebSocket error occurred: {}", e);
                break;
            }
        }
    }

    connection.mark_closed();
    registry.unregister(&id);
    info!(peer = %peer, connection_id = %id, "WebSocket connection closed and unregistered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use editor_mcp_core::ToolReply;
    use std::time::Duration;

    async fn start() -> (Arc<ConnectionRegistry>, Arc<Dispatcher>, String) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), Duration::from_secs(5)));
        let server = WebSocketServer::bind(&config, registry.clone(), dispatcher.clone())
            .await
            .unwrap();
        let url = server.url().unwrap();
        server.spawn();
        (registry, dispatcher, url)
    }

    async fn wait_for_count(registry: &ConnectionRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_is_refused() {
        let (registry, _dispatcher, url) = start().await;
        let wrong = url.replace("/ws", "/other");

        assert!(tokio_tungstenite::connect_async(wrong).await.is_err());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_host_registers_and_replies_resolve() {
        let (registry, dispatcher, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        wait_for_count(&registry, 1).await;

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .dispatch("get_active_scene", Default::default(), None)
                    .await
            }
        });

        let frame = ws.next().await.unwrap().unwrap();
        let request: editor_mcp_core::ToolRequest =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        let reply = ToolReply::success(request.id, request.name, serde_json::json!("Main"));
        ws.send(Message::text(serde_json::to_string(&reply).unwrap()))
            .await
            .unwrap();

        let reply = call.await.unwrap();
        assert!(!reply.is_error);
        assert_eq!(reply.text().as_deref(), Some("Main"));

        ws.close(None).await.unwrap();
        wait_for_count(&registry, 0).await;
    }
}
