//! Error types for the editor MCP bridge

use std::time::Duration;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    /// Dispatch attempted with zero live connections
    #[error("No active connections available")]
    NoConnection,

    /// No matching reply arrived within the configured window
    #[error("Tool call timed out after {}", describe_timeout(.0))]
    Timeout(Duration),

    /// No descriptor registered under the requested name
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    /// A matched handler failed while executing
    #[error("Error executing tool '{tool}': {message}")]
    ToolFailed { tool: String, message: String },

    /// An argument could not be coerced to its declared type
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Inbound bytes could not be parsed into an envelope
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The request could not be written to any connection
    #[error("Failed to send tool call: {0}")]
    SendFailed(String),

    /// Send attempted on a torn-down connection
    #[error("Connection has been disposed")]
    TransportClosed,

    /// Caller-supplied correlation ID collides with a pending one
    #[error("Correlation ID already pending: {0}")]
    DuplicateId(String),

    /// Pending call cancelled by its caller
    #[error("Tool call cancelled")]
    Cancelled,

    /// Pending call abandoned because the bridge is shutting down
    #[error("Bridge is shutting down")]
    ShuttingDown,

    /// WebSocket or socket level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Free-form failure raised by a tool handler
    #[error("{0}")]
    Failed(String),
}

impl BridgeError {
    /// Shorthand for a handler-level failure with a plain message
    pub fn failed(message: impl Into<String>) -> Self {
        BridgeError::Failed(message.into())
    }

    /// JSON-RPC error code for this error
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::NoConnection => error_codes::NO_CONNECTION,
            BridgeError::Timeout(_) => error_codes::TIMEOUT,
            BridgeError::UnknownTool(_) => error_codes::UNKNOWN_TOOL,
            BridgeError::ToolFailed { .. } | BridgeError::Failed(_) => error_codes::TOOL_FAILED,
            BridgeError::InvalidArgument { .. } => error_codes::INVALID_PARAMS,
            BridgeError::MalformedMessage(_) | BridgeError::Serialization(_) => {
                error_codes::PARSE_ERROR
            }
            BridgeError::Cancelled | BridgeError::ShuttingDown => error_codes::CANCELLED,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

fn describe_timeout(timeout: &Duration) -> String {
    let millis = timeout.as_millis();
    if millis % 1000 == 0 {
        format!("{} seconds", millis / 1000)
    } else {
        format!("{} ms", millis)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// JSON-RPC error codes used by the bridge
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const NO_CONNECTION: i32 = -32000;
    pub const TIMEOUT: i32 = -32001;
    pub const UNKNOWN_TOOL: i32 = -32002;
    pub const TOOL_FAILED: i32 = -32003;
    pub const CANCELLED: i32 = -32004;
}
