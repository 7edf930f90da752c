//! Streamable HTTP downstream transport: one long-lived POST whose request
//! body is a stream of newline-delimited JSON-RPC requests and whose
//! response body is the matching stream of responses.

use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures::StreamExt;
use futures::TryStreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tracing::debug;
use tracing::info;

use crate::error::BridgeErr;
use crate::error::Result;
use crate::jsonrpc::JSONRPC_VERSION;

type ResponseLines =
    tokio::io::Lines<BufReader<StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>>>;

pub struct StreamableHttpTransport {
    requests: mpsc::UnboundedSender<io::Result<Bytes>>,
    responses: ResponseLines,
    tools: Vec<Value>,
    next_id: AtomicI64,
}

impl StreamableHttpTransport {
    /// Opens the bidirectional stream and drives the handshake explicitly:
    /// `initialize`, then `tools/list`, caching the tool list.
    pub async fn connect(
        base_url: &str,
        path: &str,
        headers: HeaderMap,
        protocol_version: &str,
    ) -> Result<Self> {
        let url = format!("{base_url}{path}");
        info!("connecting via Streamable HTTP: {url}");

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let (requests, request_rx) = mpsc::unbounded::<io::Result<Bytes>>();

        // Queue the handshake before the request is sent so the server
        // sees `initialize` as soon as the connection opens.
        send_line(
            &requests,
            &json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": protocol_version,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "relay-mcp-bridge",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                },
            }),
        )?;
        send_line(
            &requests,
            &json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": 2,
                "method": "tools/list",
                "params": {},
            }),
        )?;

        let response = client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(reqwest::Body::wrap_stream(request_rx))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeErr::UnexpectedStatus(status, body));
        }
        info!("Streamable HTTP stream opened (status {status})");

        let byte_stream: BoxStream<'static, io::Result<Bytes>> = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        let mut responses = BufReader::new(StreamReader::new(byte_stream)).lines();

        let init_response = read_response(&mut responses).await?;
        let server_name = init_response
            .get("result")
            .and_then(|result| result.get("serverInfo"))
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("server initialized: {server_name}");

        let tools_response = read_response(&mut responses).await?;
        let tools = tools_response
            .get("result")
            .and_then(|result| result.get("tools"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        info!("discovered {} tools", tools.len());

        Ok(Self {
            requests,
            responses,
            tools,
            next_id: AtomicI64::new(3),
        })
    }

    pub fn tools(&self) -> Vec<Value> {
        self.tools.clone()
    }

    /// Responses arrive on the single ordered stream, and the bridge
    /// serialises its requests, so the next line answers this call.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        debug!("calling tool '{name}' over Streamable HTTP transport");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        send_line(
            &self.requests,
            &json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "method": "tools/call",
                "params": { "name": name, "arguments": arguments },
            }),
        )?;

        let response = read_response(&mut self.responses).await?;
        if let Some(error) = response.get("error") {
            return Err(BridgeErr::Protocol(error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }
}

fn send_line(tx: &mpsc::UnboundedSender<io::Result<Bytes>>, frame: &Value) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    tx.unbounded_send(Ok(Bytes::from(line)))
        .map_err(|_| BridgeErr::StreamClosed)
}

async fn read_response(lines: &mut ResponseLines) -> Result<Value> {
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                return Ok(serde_json::from_str(line)?);
            }
            None => return Err(BridgeErr::StreamClosed),
        }
    }
}
