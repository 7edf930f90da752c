//! The stdio MCP server loop: line-delimited JSON-RPC on stdin/stdout,
//! with tool calls forwarded to the remote transport.

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::jsonrpc;
use crate::jsonrpc::INTERNAL_ERROR;
use crate::jsonrpc::JsonRpcRequest;
use crate::jsonrpc::METHOD_NOT_FOUND;
use crate::jsonrpc::RequestId;
use crate::transport::RemoteTransport;

/// Size of the bounded channels between the stdio tasks. 128 messages is
/// plenty for one agent driving one tool server.
const CHANNEL_CAPACITY: usize = 128;

/// Runs until stdin reaches EOF. Three tasks: stdin reader, request
/// processor, stdout writer; stdout carries nothing but protocol frames.
pub async fn run(mut transport: RemoteTransport, protocol_version: String) -> io::Result<()> {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JsonRpcRequest>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

    let stdin_reader = tokio::spawn(async move {
        let stdin = io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => {
                    if incoming_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("invalid JSON request: {err}"),
            }
        }
        debug!("stdin reader finished (EOF)");
    });

    let stdout_writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(frame) = outgoing_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if stdout.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdout.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if stdout.flush().await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("failed to serialize response: {err}"),
            }
        }
        debug!("stdout writer exited (channel closed)");
    });

    info!("stdio MCP server ready, waiting for agent requests");
    while let Some(request) = incoming_rx.recv().await {
        if let Some(response) = handle_request(&mut transport, &protocol_version, request).await {
            if outgoing_tx.send(response).await.is_err() {
                break;
            }
        }
    }

    drop(outgoing_tx);
    let _ = tokio::join!(stdin_reader, stdout_writer);
    Ok(())
}

/// Dispatches one frame. Returns `None` for notifications, which take no
/// response.
pub async fn handle_request(
    transport: &mut RemoteTransport,
    protocol_version: &str,
    request: JsonRpcRequest,
) -> Option<Value> {
    let Some(id) = request.id else {
        debug!("notification: {}", request.method);
        return None;
    };
    debug!("request: {} ({id:?})", request.method);

    match request.method.as_str() {
        "initialize" => Some(initialize_response(id, protocol_version)),
        "tools/list" => Some(tools_response(id, transport.tools())),
        "tools/call" => {
            let params = request.params.unwrap_or_else(|| json!({}));
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match transport.call_tool(&name, arguments).await {
                Ok(result) => Some(jsonrpc::response_frame(id, result)),
                Err(err) => {
                    error!("tool call '{name}' failed: {err}");
                    Some(jsonrpc::error_frame(
                        Some(id),
                        INTERNAL_ERROR,
                        format!("tool call failed: {err}"),
                    ))
                }
            }
        }
        other => {
            warn!("unsupported method: {other}");
            Some(jsonrpc::error_frame(
                Some(id),
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ))
        }
    }
}

pub fn initialize_response(id: RequestId, protocol_version: &str) -> Value {
    jsonrpc::response_frame(
        id,
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": { "listChanged": false },
            },
            "serverInfo": {
                "name": "relay-mcp-bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
}

pub fn tools_response(id: RequestId, tools: Vec<Value>) -> Value {
    jsonrpc::response_frame(id, json!({ "tools": tools }))
}
