//! # editor-mcp-host
//!
//! Editor-facing half of the editor MCP bridge.
//!
//! This crate provides:
//! - `ToolEngine` resolving tool requests against registered providers
//! - `ConnectionManager` keeping the WebSocket link to the bridge server
//! - `SceneTools`, an in-memory scene exposing game object operations

pub mod connection;
pub mod engine;
pub mod scene;

pub use connection::{ConnectionManager, HostConfig, StatusEvent};
pub use engine::{ToolArgs, ToolDeclaration, ToolEngine, ToolHandler, ToolProvider, ToolTable};
pub use scene::SceneTools;
