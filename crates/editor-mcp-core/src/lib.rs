//! # editor-mcp-core
//!
//! Core types shared by both ends of the editor MCP bridge.
//!
//! This crate provides:
//! - Request/reply envelopes carried over the WebSocket
//! - Declarative tool metadata published by the host
//! - Connection status model and lifecycle transitions
//! - The bridge error type

pub mod envelope;
pub mod error;
pub mod status;
pub mod tool;

pub use envelope::{Arguments, ToolReply, ToolRequest, new_correlation_id};
pub use error::{BridgeError, Result, error_codes};
pub use status::{
    ConnectionEvent, ConnectionState, ConnectionStatus, Diagnostic, DiagnosticLevel,
    DiagnosticLog, MAX_DIAGNOSTICS,
};
pub use tool::{LIST_TOOLS, ParamSpec, ParamType, ToolInfo};
