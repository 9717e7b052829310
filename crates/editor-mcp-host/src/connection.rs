//! Host side WebSocket connection and its lifecycle
//!
//! [`ConnectionManager`] dials the bridge server, answers every inbound
//! [`ToolRequest`] through the [`ToolEngine`] and publishes each status
//! transition as a [`StatusEvent`].

use crate::engine::ToolEngine;
use chrono::Utc;
use editor_mcp_core::envelope::{preview, salvage_id};
use editor_mcp_core::{
    BridgeError, ConnectionEvent, ConnectionStatus, Result, ToolReply, ToolRequest,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Environment variable overriding the server URL
pub const ENV_URL: &str = "EDITOR_MCP_URL";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Configuration for the host connection
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Server URL (default: ws://localhost:8080/ws)
    pub url: String,
    /// Give up on a connect attempt after this long (default: 10s)
    pub connect_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HostConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `EDITOR_MCP_URL` when set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup(ENV_URL) {
            Some(url) => Self::new(url),
            None => Self::default(),
        }
    }
}

/// A status transition together with the status it produced
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub event: ConnectionEvent,
    pub status: ConnectionStatus,
}

struct Session {
    generation: u64,
    writer: WsWriter,
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

/// Owns the host's single connection to the bridge server
pub struct ConnectionManager {
    config: HostConfig,
    engine: Arc<ToolEngine>,
    status: RwLock<ConnectionStatus>,
    events: broadcast::Sender<StatusEvent>,
    /// Bumped by every connect and disconnect. Stale readers and in-flight
    /// connect attempts watch it to notice they were superseded.
    generation: watch::Sender<u64>,
    connect_lock: Mutex<()>,
    session: parking_lot::Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(config: HostConfig, engine: Arc<ToolEngine>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            engine,
            status: RwLock::new(ConnectionStatus::default()),
            events,
            generation: watch::Sender::new(0),
            connect_lock: Mutex::new(()),
            session: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ToolEngine> {
        &self.engine
    }

    /// Snapshot of the current status
    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Dial the server, replacing any existing connection.
    ///
    /// A [`disconnect`](Self::disconnect) issued while the handshake is in
    /// flight abandons it with [`BridgeError::Cancelled`].
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _attempt = self.connect_lock.lock().await;

        let generation = self.supersede();
        let mut superseded = self.generation.subscribe();
        self.teardown().await;
        self.apply(|status, now| status.set_disconnected("Reconnecting", now));
        self.apply(|status, now| status.begin_connect(now));

        info!("Connecting to {}", self.config.url);
        let connecting = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let cancelled = async {
            let _ = superseded.wait_for(|current| *current != generation).await;
        };
        let outcome = tokio::select! {
            _ = cancelled => {
                info!("Connect attempt to {} cancelled", self.config.url);
                return Err(BridgeError::Cancelled);
            }
            outcome = connecting => outcome,
        };

        let ws = match outcome {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                let message = format!("Failed to connect to {}: {}", self.config.url, e);
                return Err(self.fail(message));
            }
            Err(_) => {
                let message = format!(
                    "Connection to {} timed out after {:?}",
                    self.config.url,
                    self.config.connect_timeout
                );
                return Err(self.fail(message));
            }
        };

        let (sink, stream) = ws.split();
        let writer: WsWriter = Arc::new(Mutex::new(sink));
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Hold the slot so an early close cannot race the session store
        {
            let mut slot = self.session.lock();
            let reader = tokio::spawn(self.clone().read_loop(
                generation,
                stream,
                writer.clone(),
                shutdown_rx,
            ));
            *slot = Some(Session {
                generation,
                writer,
                shutdown,
                reader,
            });
        }

        // Only announce Connected once send() can reach the session
        if self.apply(|status, now| status.set_connected(now)).is_none() {
            self.teardown().await;
            if *self.generation.borrow() != generation {
                info!("Connect attempt to {} cancelled", self.config.url);
                return Err(BridgeError::Cancelled);
            }
            let reason = self.status().disconnect_reason.unwrap_or_default();
            return Err(BridgeError::Transport(format!(
                "Connection to {} closed during handshake: {}",
                self.config.url, reason
            )));
        }

        info!("Connected to {}", self.config.url);
        Ok(())
    }

    /// Close the connection, abandoning any connect attempt in flight.
    ///
    /// A no-op when neither connected nor connecting.
    pub async fn disconnect(&self) {
        self.supersede();
        // Leave Connecting right away; the attempt notices and gives up the lock
        self.apply(|status, now| {
            if status.is_connecting() {
                status.set_disconnected("Disconnected by host", now)
            } else {
                None
            }
        });

        let _attempt = self.connect_lock.lock().await;
        self.teardown().await;
        self.apply(|status, now| status.set_disconnected("Disconnected by host", now));
    }

    /// Send a raw text frame to the server
    pub async fn send(&self, message: &str) -> Result<()> {
        let writer = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(session) if self.status.read().is_connected() => session.writer.clone(),
                _ => {
                    warn!("Cannot send message: not connected");
                    return Err(BridgeError::NoConnection);
                }
            }
        };

        let mut writer = writer.lock().await;
        writer
            .send(Message::text(message.to_owned()))
            .await
            .map_err(|e| BridgeError::SendFailed(e.to_string()))
    }

    /// Start a new generation, invalidating the current session and attempt
    fn supersede(&self) -> u64 {
        let mut current = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            current = *generation;
        });
        current
    }

    fn fail(&self, message: String) -> BridgeError {
        error!("{}", message);
        self.apply(|status, now| status.set_failed(message.clone(), now));
        BridgeError::Transport(message)
    }

    /// Apply a transition and publish it if it was accepted
    fn apply(
        &self,
        transition: impl FnOnce(
            &mut ConnectionStatus,
            chrono::DateTime<Utc>,
        ) -> Option<ConnectionEvent>,
    ) -> Option<ConnectionEvent> {
        let (event, snapshot) = {
            let mut status = self.status.write();
            let event = transition(&mut *status, Utc::now())?;
            (event, (*status).clone())
        };

        debug!(event = event.name(), state = ?snapshot.state, "Connection status changed");
        let _ = self.events.send(StatusEvent {
            event,
            status: snapshot,
        });
        Some(event)
    }

    /// Stop the current session's reader and close its socket
    async fn teardown(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };

        let _ = session.shutdown.send(true);
        session.reader.abort();
        let mut writer = session.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error closing WebSocket: {}", e);
        }
    }

    /// The server went away while `generation` was current
    fn lost(&self, generation: u64, reason: String) {
        let stale = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                if let Some(session) = slot.take() {
                    let _ = session.shutdown.send(true);
                }
                false
            } else {
                true
            }
        };
        if stale {
            return;
        }

        warn!("Connection lost: {}", reason);
        self.apply(|status, now| status.set_disconnected(reason, now));
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut stream: SplitStream<WsStream>,
        writer: WsWriter,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    self.spawn_request(text.as_str().to_owned(), &writer, &shutdown);
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => self.spawn_request(text, &writer, &shutdown),
                    Err(_) => warn!("Discarding non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => {
                            format!("{} (Code: {})", frame.reason.as_str(), u16::from(frame.code))
                        }
                        None => "Connection closed by server".to_string(),
                    };
                    self.lost(generation, reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.lost(generation, e.to_string());
                    break;
                }
                None => {
                    self.lost(generation, "Connection closed by server".to_string());
                    break;
                }
            }
        }
    }

    /// Answer one inbound request on its own task
    fn spawn_request(&self, text: String, writer: &WsWriter, shutdown: &watch::Receiver<bool>) {
        let engine = self.engine.clone();
        let writer = writer.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            debug!(json = %preview(&text), "Received request");
            let reply = match serde_json::from_str::<ToolRequest>(&text) {
                Ok(request) => engine.invoke(request).await,
                Err(e) => {
                    warn!("Malformed request: {}", e);
                    let id = salvage_id(&text).unwrap_or_default();
                    ToolReply::error(id, "", &BridgeError::MalformedMessage(e.to_string()))
                }
            };

            if *shutdown.borrow() {
                debug!(id = %reply.id, "Session closed, dropping reply");
                return;
            }

            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize reply: {}", e);
                    return;
                }
            };
            debug!(json = %preview(&json), "Sending reply");

            let mut writer = writer.lock().await;
            if let Err(e) = writer.send(Message::text(json)).await {
                warn!(id = %reply.id, "Failed to send reply: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneTools;
    use editor_mcp_core::ConnectionState;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn manager(url: String) -> Arc<ConnectionManager> {
        let engine = ToolEngine::builder()
            .provider(Arc::new(SceneTools::new("Main")))
            .build();
        ConnectionManager::new(HostConfig::new(url), Arc::new(engine))
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.status().state != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_config_from_env() {
        let config = HostConfig::from_lookup(|key| match key {
            ENV_URL => Some("ws://editor:9000/bridge".into()),
            _ => None,
        });
        assert_eq!(config.url, "ws://editor:9000/bridge");
        assert_eq!(HostConfig::from_lookup(|_| None).url, "ws://localhost:8080/ws");
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        // Bind then drop to get a port nothing listens on
        let (listener, url) = listener().await;
        drop(listener);

        let manager = manager(url);
        let mut events = manager.subscribe();

        assert!(manager.connect().await.is_err());

        assert_eq!(events.recv().await.unwrap().event, ConnectionEvent::Started);
        let failed = events.recv().await.unwrap();
        assert_eq!(failed.event, ConnectionEvent::Failed);

        let status = manager.status();
        assert!(status.has_error());
        assert!(status.last_error.unwrap().starts_with("Failed to connect"));
        assert_eq!(status.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_publishes_nothing() {
        let manager = manager("ws://127.0.0.1:1/ws".into());
        let mut events = manager.subscribe();

        manager.disconnect().await;

        assert!(manager.status().is_disconnected());
        assert!(events.try_recv().is_err());
        assert!(matches!(
            manager.send("hello").await,
            Err(BridgeError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn test_answers_requests_and_records_remote_close() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::text(
                r#"{"id":"c1","name":"create_game_object","arguments":{"name":"Cube"}}"#
                    .to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::text(r#"{"id":"bad","name":42}"#.to_string()))
                .await
                .unwrap();

            let mut replies = Vec::new();
            while replies.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        replies.push(serde_json::from_str::<ToolReply>(text.as_str()).unwrap());
                    }
                    Some(_) => {}
                    None => break,
                }
            }

            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "Editor shutting down".to_string().into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
            replies
        });

        let manager = manager(url);
        manager.connect().await.unwrap();
        assert!(manager.status().is_connected());
        assert!(manager.status().connected_at.is_some());

        let mut replies = server.await.unwrap();
        replies.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(replies[0].id, "bad");
        assert!(replies[0].is_error);
        assert!(replies[0].text().unwrap().starts_with("Malformed message"));
        assert_eq!(replies[1].id, "c1");
        assert!(!replies[1].is_error);
        assert_eq!(replies[1].content[0]["name"], serde_json::json!("Cube"));

        wait_for_state(&manager, ConnectionState::Disconnected).await;
        assert_eq!(
            manager.status().disconnect_reason.as_deref(),
            Some("Editor shutting down (Code: 1001)")
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect_attempt() {
        let (listener, url) = listener().await;
        // Accept TCP but never answer the upgrade
        let stalled = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                sockets.push(stream);
            }
        });

        let manager = manager(url);
        let mut events = manager.subscribe();
        let attempt = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        assert_eq!(events.recv().await.unwrap().event, ConnectionEvent::Started);

        tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .expect("disconnect should not wait for the handshake");

        assert_eq!(
            events.recv().await.unwrap().event,
            ConnectionEvent::Disconnected
        );
        let status = manager.status();
        assert!(status.is_disconnected());
        assert!(!status.has_error());
        assert_eq!(
            status.disconnect_reason.as_deref(),
            Some("Disconnected by host")
        );
        assert!(matches!(attempt.await.unwrap(), Err(BridgeError::Cancelled)));
        assert!(events.try_recv().is_err());

        stalled.abort();
    }

    #[tokio::test]
    async fn test_send_available_when_connected_is_published() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                    Some(Ok(_)) => {}
                    _ => return String::new(),
                }
            }
        });

        let manager = manager(url);
        let mut events = manager.subscribe();
        let attempt = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });

        while events.recv().await.unwrap().event != ConnectionEvent::Connected {}
        tokio_test::assert_ok!(manager.send("hello").await);

        assert_eq!(server.await.unwrap(), "hello");
        tokio_test::assert_ok!(attempt.await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    sockets.push(ws);
                }
            }
        });

        let manager = manager(url);
        tokio_test::assert_ok!(manager.connect().await);
        let mut events = manager.subscribe();

        tokio_test::assert_ok!(manager.connect().await);
        assert_eq!(
            events.recv().await.unwrap().event,
            ConnectionEvent::Disconnected
        );
        assert_eq!(events.recv().await.unwrap().event, ConnectionEvent::Started);
        assert_eq!(events.recv().await.unwrap().event, ConnectionEvent::Connected);
        assert!(manager.status().is_connected());

        manager.disconnect().await;
        assert_eq!(
            events.recv().await.unwrap().event,
            ConnectionEvent::Disconnected
        );
        assert_eq!(
            manager.status().disconnect_reason.as_deref(),
            Some("Disconnected by host")
        );
    }
}
