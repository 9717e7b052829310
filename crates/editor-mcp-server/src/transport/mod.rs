//! Transports: MCP JSON-RPC on stdio towards the agent, WebSocket towards the host

pub mod stdio;
pub mod websocket;
