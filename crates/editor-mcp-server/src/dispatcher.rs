//! Correlation dispatcher
//!
//! Turns "send over the WebSocket, wait for the matching reply" into an
//! awaitable call.
//!
//! Flow:
//! 1. `dispatch()` checks there is a live connection
//! 2. A pending slot with its own timeout timer is registered under the
//!    request's correlation ID
//! 3. The request envelope is broadcast through the [`ConnectionRegistry`]
//! 4. The receive loop calls `handle_incoming_reply()`, which removes the
//!    slot and resolves it
//!
//! Whoever removes a slot from the table resolves it, so every slot is
//! resolved exactly once no matter how a reply, the timer, a cancellation
//! and shutdown race each other.

use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use editor_mcp_core::envelope::preview;
use editor_mcp_core::{Arguments, BridgeError, ToolReply, ToolRequest, new_correlation_id};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Default window for a reply to arrive
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An outstanding call awaiting exactly one resolution
struct PendingRequest {
    name: String,
    sender: oneshot::Sender<ToolReply>,
    created_at: Instant,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn resolve(self, reply: ToolReply) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        // Receiver dropped means the caller went away; nothing to do
        let _ = self.sender.send(reply);
    }
}

type PendingTable = Arc<DashMap<String, PendingRequest>>;

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    unmatched: AtomicU64,
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub unmatched: u64,
    pub pending: usize,
}

/// Removes the slot if the dispatching future is dropped before resolution
struct PendingGuard {
    id: String,
    pending: PendingTable,
    counters: Arc<Counters>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some((_, slot)) = self.pending.remove(&self.id) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(id = %self.id, tool = %slot.name, "Dispatch dropped by caller, slot removed");
            if let Some(timer) = slot.timer {
                timer.abort();
            }
        }
    }
}

/// Correlates outgoing tool calls with the replies that answer them
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    pending: PendingTable,
    counters: Arc<Counters>,
    default_timeout: Duration,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            default_timeout,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Invoke `name` on the host and wait for its reply.
    ///
    /// Always resolves to a reply; failures are carried as `isError` replies.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> ToolReply {
        self.dispatch_request(ToolRequest::new(name, arguments), timeout)
            .await
    }

    /// Like [`dispatch`](Self::dispatch) with a caller-built envelope.
    ///
    /// An empty `id` is replaced by a generated one.
    pub async fn dispatch_request(
        &self,
        mut request: ToolRequest,
        timeout: Option<Duration>,
    ) -> ToolReply {
        if request.id.is_empty() {
            request.id = new_correlation_id();
        }

        if self.is_shutting_down() {
            return ToolReply::error_for(&request, &BridgeError::ShuttingDown);
        }

        if self.registry.live_count() == 0 {
            warn!(tool = %request.name, "No active connections, rejecting tool call");
            return ToolReply::error_for(&request, &BridgeError::NoConnection);
        }

        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => return ToolReply::error_for(&request, &BridgeError::from(e)),
        };

        let timeout = timeout.unwrap_or(self.default_timeout);
        let receiver = match self.register(&request, timeout) {
            Ok(receiver) => receiver,
            Err(e) => return ToolReply::error_for(&request, &e),
        };
        let _guard = PendingGuard {
            id: request.id.clone(),
            pending: self.pending.clone(),
            counters: self.counters.clone(),
        };

        debug!(id = %request.id, json = %preview(&payload), "Sending tool call");
        let outcomes = self.registry.broadcast(&payload).await;
        let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
        info!(
            id = %request.id,
            tool = %request.name,
            "Tool call sent to {}/{} connections",
            delivered,
            outcomes.len()
        );

        if delivered == 0 {
            let error = BridgeError::SendFailed("no connection accepted the message".into());
            if let Some((_, slot)) = self.pending.remove(&request.id) {
                slot.resolve(ToolReply::error_for(&request, &error));
            }
        }

        match receiver.await {
            Ok(reply) => reply,
            // Sender dropped without a reply; only happens if the slot was
            // removed without resolution
            Err(_) => ToolReply::error_for(&request, &BridgeError::Cancelled),
        }
    }

    /// Register the pending slot together with its timer
    fn register(
        &self,
        request: &ToolRequest,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ToolReply>, BridgeError> {
        let (sender, receiver) = oneshot::channel();

        match self.pending.entry(request.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BridgeError::DuplicateId(request.id.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // The timer touches the table only after sleeping, and the
                // entry guard holds the shard until the slot is in place
                let timer = tokio::spawn(expire_after(
                    self.pending.clone(),
                    self.counters.clone(),
                    request.id.clone(),
                    request.name.clone(),
                    timeout,
                ));
                slot.insert(PendingRequest {
                    name: request.name.clone(),
                    sender,
                    created_at: Instant::now(),
                    timer: Some(timer.abort_handle()),
                });
            }
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);

        // shutdown() may have drained the table between the caller's check
        // and the insert above
        if self.is_shutting_down() {
            if let Some((_, slot)) = self.pending.remove(&request.id) {
                if let Some(timer) = slot.timer {
                    timer.abort();
                }
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            return Err(BridgeError::ShuttingDown);
        }

        debug!(id = %request.id, tool = %request.name, "Registered pending request");
        Ok(receiver)
    }

    /// Resolve the pending slot matching `reply.id`.
    ///
    /// Returns false when no slot matched; the reply is then dropped.
    pub fn handle_incoming_reply(&self, reply: ToolReply) -> bool {
        match self.pending.remove(&reply.id) {
            Some((id, slot)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    id = %id,
                    tool = %slot.name,
                    is_error = reply.is_error,
                    elapsed_ms = slot.created_at.elapsed().as_millis() as u64,
                    "Tool call completed"
                );
                slot.resolve(reply);
                true
            }
            None => {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!(id = %reply.id, "Received reply for unknown or expired correlation ID");
                false
            }
        }
    }

    /// Parse a text frame from the host and route it as a reply
    pub fn handle_incoming_text(&self, text: &str) -> bool {
        debug!(json = %preview(text), "Handling reply frame");
        match serde_json::from_str::<ToolReply>(text) {
            Ok(reply) => self.handle_incoming_reply(reply),
            Err(e) => {
                warn!(
                    error = %BridgeError::MalformedMessage(e.to_string()),
                    json = %preview(text),
                    "Discarding unparsable reply"
                );
                false
            }
        }
    }

    /// Resolve a pending call with a cancellation error
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some((id, slot)) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let reply = ToolReply::error(id, slot.name.clone(), &BridgeError::Cancelled);
                slot.resolve(reply);
                true
            }
            None => false,
        }
    }

    /// Resolve every pending call with a shutdown error.
    ///
    /// Calls dispatched afterwards are refused with the same error.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut resolved = 0;
        for id in ids {
            if let Some((id, slot)) = self.pending.remove(&id) {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let reply = ToolReply::error(id, slot.name.clone(), &BridgeError::ShuttingDown);
                slot.resolve(reply);
                resolved += 1;
            }
        }
        if resolved > 0 {
            info!("Resolved {} pending tool calls on shutdown", resolved);
        }
        resolved
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }
}

/// Timer task attached to one pending slot
async fn expire_after(
    pending: PendingTable,
    counters: Arc<Counters>,
    id: String,
    name: String,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    if let Some((id, slot)) = pending.remove(&id) {
        counters.timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(id = %id, tool = %name, "Tool call timed out");
        let reply = ToolReply::error(id, name, &BridgeError::Timeout(timeout));
        // The timer is the resolver here; don't abort ourselves
        let _ = slot.sender.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::MockConnection;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, rx) = MockConnection::new();
        registry.register(connection);
        (Arc::new(Dispatcher::new(registry, DEFAULT_TIMEOUT)), rx)
    }

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<String>) -> ToolRequest {
        let frame = rx.recv().await.expect("request frame");
        serde_json::from_str(&frame).expect("valid request")
    }

    #[tokio::test]
    async fn test_no_connection_fails_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(registry, DEFAULT_TIMEOUT);

        let reply = dispatcher
            .dispatch("get_components", args(json!({"gameObjectId": "abc"})), None)
            .await;

        assert!(reply.is_error);
        assert_eq!(reply.text().as_deref(), Some("No active connections available"));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.stats().registered, 0);
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_call() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("r1", "get_active_scene", Arguments::new()), None)
                .await
        });

        let request = next_request(&mut rx).await;
        assert_eq!(request.id, "r1");
        assert!(dispatcher.is_pending("r1"));

        let matched = dispatcher.handle_incoming_reply(ToolReply::success(
            "r1",
            "get_active_scene",
            json!({"name": "main"}),
        ));
        assert!(matched);

        let reply = call.await.unwrap();
        assert!(!reply.is_error);
        assert_eq!(reply.content, vec![json!({"name": "main"})]);
        assert!(!dispatcher.is_pending("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_slot_and_drops_late_reply() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch_request(
                ToolRequest::with_id("r2", "get_active_scene", Arguments::new()),
                Some(Duration::from_secs(30)),
            )
            .await
        });
        next_request(&mut rx).await;

        let reply = call.await.unwrap();
        assert!(reply.is_error);
        assert_eq!(
            reply.text().as_deref(),
            Some("Tool call timed out after 30 seconds")
        );
        assert_eq!(dispatcher.pending_count(), 0);

        let late = ToolReply::success("r2", "get_active_scene", json!(null));
        assert!(!dispatcher.handle_incoming_reply(late));

        let stats = dispatcher.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (dispatcher, mut rx) = setup();

        let d3 = dispatcher.clone();
        let r3 = tokio::spawn(async move {
            d3.dispatch_request(ToolRequest::with_id("r3", "a", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;
        let d4 = dispatcher.clone();
        let r4 = tokio::spawn(async move {
            d4.dispatch_request(ToolRequest::with_id("r4", "b", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;

        dispatcher.handle_incoming_reply(ToolReply::success("r4", "b", json!(4)));
        let reply4 = r4.await.unwrap();
        assert_eq!(reply4.content, vec![json!(4)]);

        // r3 is still waiting
        assert!(dispatcher.is_pending("r3"));
        assert!(!r3.is_finished());

        dispatcher.handle_incoming_reply(ToolReply::success("r3", "a", json!(3)));
        assert_eq!(r3.await.unwrap().content, vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_reverse_replies() {
        let (dispatcher, mut rx) = setup();
        let count = 16;

        let mut calls = Vec::new();
        for i in 0..count {
            let d = dispatcher.clone();
            calls.push(tokio::spawn(async move {
                d.dispatch("echo", args(json!({ "n": i })), None).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..count {
            requests.push(next_request(&mut rx).await);
        }
        assert_eq!(dispatcher.pending_count(), count);

        for request in requests.iter().rev() {
            let n = request.arguments["n"].clone();
            dispatcher.handle_incoming_reply(ToolReply::success(&request.id, "echo", n));
        }

        for (i, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap();
            assert_eq!(reply.content, vec![json!(i)]);
        }
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.stats().completed, count as u64);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("r5", "a", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;

        assert!(!dispatcher.handle_incoming_reply(ToolReply::success("zzz", "a", json!(1))));
        assert!(!dispatcher.handle_incoming_text("{not json"));
        assert!(dispatcher.is_pending("r5"));

        assert!(dispatcher.handle_incoming_text(r#"{"id":"r5","name":"a","content":1,"isError":false}"#));
        assert_eq!(call.await.unwrap().content, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_error_reply_resolves_normally() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch("nonexistent_tool", Arguments::new(), None).await
        });
        let request = next_request(&mut rx).await;

        dispatcher.handle_incoming_reply(ToolReply::error_for(
            &request,
            &BridgeError::UnknownTool("nonexistent_tool".into()),
        ));

        let reply = call.await.unwrap();
        assert!(reply.is_error);
        assert_eq!(
            reply.text().as_deref(),
            Some("Tool 'nonexistent_tool' not found")
        );
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let first = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("dup", "a", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;

        let second = dispatcher
            .dispatch_request(ToolRequest::with_id("dup", "a", Arguments::new()), None)
            .await;
        assert!(second.is_error);
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.handle_incoming_reply(ToolReply::success("dup", "a", json!(true)));
        assert!(!first.await.unwrap().is_error);
    }

    #[tokio::test]
    async fn test_all_sends_failing_resolves_with_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, _rx) = MockConnection::failing();
        registry.register(connection);
        let dispatcher = Dispatcher::new(registry, DEFAULT_TIMEOUT);

        let reply = dispatcher.dispatch("a", Arguments::new(), None).await;

        assert!(reply.is_error);
        assert!(reply.text().unwrap().starts_with("Failed to send tool call"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_dispatch_removes_slot() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("r6", "a", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;
        assert!(dispatcher.is_pending("r6"));

        call.abort();
        let _ = call.await;

        assert!(!dispatcher.is_pending("r6"));
        assert_eq!(dispatcher.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let a = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("a", "x", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;
        let d = dispatcher.clone();
        let b = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("b", "x", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;
        let d = dispatcher.clone();
        let c = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("c", "x", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;

        assert!(dispatcher.cancel("a"));
        assert!(!dispatcher.cancel("a"));
        assert_eq!(a.await.unwrap().text().as_deref(), Some("Tool call cancelled"));

        assert_eq!(dispatcher.shutdown(), 2);
        for call in [b, c] {
            let reply = call.await.unwrap();
            assert!(reply.is_error);
            assert_eq!(reply.text().as_deref(), Some("Bridge is shutting down"));
        }
        assert_eq!(dispatcher.pending_count(), 0);

        let late = dispatcher.dispatch("x", Arguments::new(), None).await;
        assert_eq!(late.text().as_deref(), Some("Bridge is shutting down"));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.stats().registered, 3);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_calls_still_starting() {
        let (dispatcher, _rx) = setup();
        assert_eq!(dispatcher.shutdown(), 0);

        let reply = dispatcher
            .dispatch_request(ToolRequest::with_id("late", "x", Arguments::new()), None)
            .await;

        assert!(reply.is_error);
        assert_eq!(reply.id, "late");
        assert_eq!(reply.text().as_deref(), Some("Bridge is shutting down"));
        assert!(!dispatcher.is_pending("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_timeout_reports_millis() {
        let (dispatcher, _rx) = setup();

        let reply = dispatcher
            .dispatch("a", Arguments::new(), Some(Duration::from_millis(250)))
            .await;

        assert_eq!(
            reply.text().as_deref(),
            Some("Tool call timed out after 250 ms")
        );
    }

    #[tokio::test]
    async fn test_slot_is_registered_with_timer() {
        let (dispatcher, mut rx) = setup();

        let d = dispatcher.clone();
        let call = tokio::spawn(async move {
            d.dispatch_request(ToolRequest::with_id("t1", "a", Arguments::new()), None)
                .await
        });
        next_request(&mut rx).await;

        // A visible slot always carries its timer, so resolving it aborts one
        assert!(
            dispatcher
                .pending
                .get("t1")
                .is_some_and(|slot| slot.timer.is_some())
        );
        dispatcher.handle_incoming_reply(ToolReply::success("t1", "a", json!(1)));
        assert!(!call.await.unwrap().is_error);
    }
}
