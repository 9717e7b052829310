//! stdio transport for MCP JSON-RPC

use crate::BridgeServer;
use crate::mcp::{InitializeResult, Notification, Request, Response};
use crate::registry::RegistryEvent;
use crate::tools::{handle_tools_call, handle_tools_list};
use editor_mcp_core::{BridgeError, Result, error_codes};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Run the MCP server on stdio
pub async fn run(server: Arc<BridgeServer>) -> Result<()> {
    run_with(
        server,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Serve newline-delimited JSON-RPC from `reader`, answering on `writer`.
///
/// Every request is handled on its own task so a slow tool call does not
/// hold up the next line. Returns once the reader hits EOF and all
/// in-flight requests have been answered.
pub async fn run_with<R, W>(server: Arc<BridgeServer>, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let out = Arc::new(Mutex::new(writer));
    let mut line = String::new();
    let mut in_flight = JoinSet::new();

    info!("Editor MCP server starting on stdio");

    // Host connects and disconnects change the tool catalog
    let mut event_rx = server.registry().subscribe();
    let out_for_events = out.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    match event {
                        RegistryEvent::Registered(id) => debug!(connection_id = %id, "Host connected"),
                        RegistryEvent::Unregistered(id) => {
                            debug!(connection_id = %id, "Host disconnected")
                        }
                    }
                    if let Err(e) =
                        write_message(&out_for_events, &Notification::tools_list_changed()).await
                    {
                        error!("Failed to write tool list notification: {}", e);
                        break;
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Registry event channel closed");
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Event forwarder lagged, missed {} events", n);
                }
            }
        }
    });

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| BridgeError::Transport(format!("Failed to read stdin: {}", e)))?;

        if bytes_read == 0 {
            info!("Client disconnected (EOF)");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {}", trimmed);

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let response =
                    Response::error(None, error_codes::PARSE_ERROR, format!("Parse error: {}", e));
                write_message(&out, &response).await?;
                continue;
            }
        };

        let server = server.clone();
        let out = out.clone();
        in_flight.spawn(async move {
            let Some(response) = handle_request(request, &server).await else {
                return;
            };
            if let Err(e) = write_message(&out, &response).await {
                error!("Failed to write response: {}", e);
            }
        });

        // Reap finished handlers as we go
        while in_flight.try_join_next().is_some() {}
    }

    let cancelled = server.shutdown();
    if cancelled > 0 {
        info!("Cancelled {} pending tool calls", cancelled);
    }
    while in_flight.join_next().await.is_some() {}
    event_task.abort();

    Ok(())
}

async fn write_message<W, T>(out: &Mutex<W>, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(message)?;
    debug!("Sending: {}", json);
    json.push('\n');

    let mut out = out.lock().await;
    out.write_all(json.as_bytes())
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to write stdout: {}", e)))?;
    out.flush()
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to flush stdout: {}", e)))?;
    Ok(())
}

/// Produce the reply for one request; notifications get none
async fn handle_request(request: Request, server: &BridgeServer) -> Option<Response> {
    if request.is_notification() {
        match request.method.as_str() {
            "notifications/initialized" | "initialized" => debug!("Client initialized"),
            other => debug!("Ignoring notification: {}", other),
        }
        return None;
    }

    let id = request.id;
    let response = match request.method.as_str() {
        "initialize" => match serde_json::to_value(InitializeResult::current()) {
            Ok(result) => Response::success(id, result),
            Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
        },
        "ping" => Response::success(id, serde_json::json!({})),
        "tools/list" => handle_tools_list(id, server).await,
        "tools/call" => handle_tools_call(id, request.params, server).await,
        _ => Response::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    };
    Some(response)
}
