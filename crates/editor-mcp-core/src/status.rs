//! Connection status and diagnostics for the host's outbound connection
//!
//! The transition methods on [`ConnectionStatus`] encode the lifecycle state
//! machine. Each returns the [`ConnectionEvent`] it produced, or `None` when
//! the transition is not allowed from the current state (status untouched).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of diagnostics kept in a status
pub const MAX_DIAGNOSTICS: usize = 5;

/// State of the outbound connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Severity of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// A single diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-capacity diagnostics trail, oldest entry evicted first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticLog {
    entries: VecDeque<Diagnostic>,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_DIAGNOSTICS),
        }
    }
}

impl DiagnosticLog {
    /// Append an entry, evicting the oldest when full
    pub fn push(&mut self, diagnostic: Diagnostic) {
        if self.entries.len() == MAX_DIAGNOSTICS {
            self.entries.pop_front();
        }
        self.entries.push_back(diagnostic);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by arrival
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&Diagnostic> {
        self.entries.back()
    }
}

/// Lifecycle notification published after every applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A connect attempt started
    Started,
    /// The attempt succeeded
    Connected,
    /// The attempt failed
    Failed,
    /// An open or opening connection went away
    Disconnected,
}

impl ConnectionEvent {
    /// Stable event name for UI collaborators
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Started => "mcp.connection.started",
            ConnectionEvent::Connected => "mcp.connection.success",
            ConnectionEvent::Failed => "mcp.connection.failed",
            ConnectionEvent::Disconnected => "mcp.disconnected",
        }
    }
}

/// Status and diagnostic information for the outbound connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub disconnect_reason: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub diagnostics: DiagnosticLog,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn has_error(&self) -> bool {
        self.state == ConnectionState::Failed
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// `Disconnected | Failed -> Connecting`
    pub fn begin_connect(&mut self, now: DateTime<Utc>) -> Option<ConnectionEvent> {
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            return None;
        }
        self.state = ConnectionState::Connecting;
        self.last_error = None;
        self.disconnect_reason = None;
        self.connected_at = None;
        self.last_attempt_at = Some(now);
        Some(ConnectionEvent::Started)
    }

    /// `Connecting -> Connected`
    pub fn set_connected(&mut self, now: DateTime<Utc>) -> Option<ConnectionEvent> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Connected;
        self.connected_at = Some(now);
        self.last_error = None;
        self.disconnect_reason = None;
        self.diagnostics.clear();
        Some(ConnectionEvent::Connected)
    }

    /// `Connecting -> Failed`
    pub fn set_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<ConnectionEvent> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        let error = error.into();
        self.state = ConnectionState::Failed;
        self.connected_at = None;
        self.add_diagnostic(DiagnosticLevel::Error, error.clone(), now);
        self.last_error = Some(error);
        Some(ConnectionEvent::Failed)
    }

    /// `Connected | Connecting -> Disconnected`
    pub fn set_disconnected(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<ConnectionEvent> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return None;
        }
        let reason = reason.into();
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
        self.add_diagnostic(
            DiagnosticLevel::Warning,
            format!("Disconnected: {}", reason),
            now,
        );
        self.disconnect_reason = Some(reason);
        Some(ConnectionEvent::Disconnected)
    }

    pub fn add_diagnostic(
        &mut self,
        level: DiagnosticLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.diagnostics.push(Diagnostic {
            level,
            message: message.into(),
            timestamp: now,
        });
    }
}
