//! MCP tool handlers forwarding to the connected host

use crate::BridgeServer;
use crate::mcp::{CallToolResult, RequestId, Response, ToolCallParams, ToolDef};
use editor_mcp_core::{Arguments, BridgeError, LIST_TOOLS, ToolInfo, error_codes};
use serde_json::Value;
use tracing::{debug, warn};

/// Fetch the host's tool catalog.
///
/// Returns an empty catalog when no host answers; the client is told to
/// refetch once a host connects.
pub async fn fetch_catalog(server: &BridgeServer) -> Vec<ToolInfo> {
    if server.registry().live_count() == 0 {
        debug!("No host connected, returning empty tool catalog");
        return Vec::new();
    }

    let reply = server
        .dispatcher()
        .dispatch(LIST_TOOLS, Arguments::new(), Some(server.config().list_timeout))
        .await;

    if reply.is_error {
        warn!(
            "Host refused tool catalog request: {}",
            reply.text().unwrap_or_default()
        );
        return Vec::new();
    }

    match reply.content.into_iter().next() {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Host returned an unreadable tool catalog: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}

/// Handle a tools/list request
pub async fn handle_tools_list(id: Option<RequestId>, server: &BridgeServer) -> Response {
    let tools: Vec<ToolDef> = fetch_catalog(server).await.iter().map(ToolDef::from).collect();
    Response::success(id, serde_json::json!({ "tools": tools }))
}

/// Handle a tools/call request
pub async fn handle_tools_call(
    id: Option<RequestId>,
    params: Value,
    server: &BridgeServer,
) -> Response {
    let params: ToolCallParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            let error = BridgeError::InvalidArgument {
                name: "params".into(),
                reason: e.to_string(),
            };
            return Response::error(id, error.code(), error.to_string());
        }
    };

    let reply = server
        .dispatcher()
        .dispatch(&params.name, params.arguments.unwrap_or_default(), None)
        .await;

    match serde_json::to_value(CallToolResult::from(reply)) {
        Ok(result) => Response::success(id, result),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}
