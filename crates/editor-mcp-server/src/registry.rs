//! Registry of live host connections

use async_trait::async_trait;
use dashmap::DashMap;
use editor_mcp_core::Result;
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque identity of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A transport endpoint that can carry text envelopes to the host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Liveness predicate checked before every send
    fn is_connected(&self) -> bool;

    /// Write one text message
    async fn send(&self, message: &str) -> Result<()>;

    /// Human readable peer description for logs
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Result of a send attempt on one connection
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(ConnectionId),
    /// Liveness predicate was false, nothing written
    Skipped(ConnectionId),
    Failed(ConnectionId, String),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered(_))
    }
}

/// Snapshot of a registered connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub connected: bool,
}

/// Registration changes published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ConnectionId),
    Unregistered(ConnectionId),
}

/// Registry of live connections
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<dyn Connection>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            connections: DashMap::new(),
            event_tx,
        }
    }

    /// Register a connection and return its identity
    pub fn register(&self, connection: Arc<dyn Connection>) -> ConnectionId {
        let id = ConnectionId::new();
        let peer = connection.peer();
        self.connections.insert(id, connection);
        info!(connection_id = %id, peer = %peer, "Connection registered");
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(RegistryEvent::Registered(id));
        id
    }

    /// Unregister a connection by identity
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        if self.connections.remove(id).is_some() {
            info!(connection_id = %id, "Connection unregistered");
            let _ = self.event_tx.send(RegistryEvent::Unregistered(*id));
            true
        } else {
            false
        }
    }

    /// Unregister every entry holding this exact connection object
    pub fn unregister_connection(&self, connection: &Arc<dyn Connection>) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| Arc::ptr_eq(entry.value(), connection))
            .map(|entry| *entry.key())
            .collect();

        ids.iter().filter(|id| self.unregister(id)).count()
    }

    /// Send `message` to every registered connection.
    ///
    /// Attempts run concurrently and independently; a failing connection is
    /// logged and reported but stays registered.
    pub async fn broadcast(&self, message: &str) -> Vec<SendOutcome> {
        // Snapshot so no map guard is held across an await
        let targets: Vec<(ConnectionId, Arc<dyn Connection>)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let attempts = targets.into_iter().map(|(id, connection)| async move {
            if !connection.is_connected() {
                debug!(connection_id = %id, "Skipping disconnected connection");
                return SendOutcome::Skipped(id);
            }
            match connection.send(message).await {
                Ok(()) => SendOutcome::Delivered(id),
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Failed to send to connection");
                    SendOutcome::Failed(id, e.to_string())
                }
            }
        });

        join_all(attempts).await
    }

    /// Snapshot of all registered connections
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                id: *entry.key(),
                peer: entry.value().peer(),
                connected: entry.value().is_connected(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Number of registered connections whose liveness predicate holds
    pub fn live_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }

    /// Number of registered connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Subscribe to register/unregister events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}
