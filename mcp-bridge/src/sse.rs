//! SSE downstream transport.
//!
//! A long-lived GET carries server-pushed events; the first `data:` event
//! is a server-status object. Tool discovery and invocation go over POSTs
//! to the sibling `/message` endpoint.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::BridgeErr;
use crate::error::Result;
use crate::jsonrpc::JSONRPC_VERSION;

pub struct SseTransport {
    client: reqwest::Client,
    message_url: String,
    tools: Vec<Value>,
    next_id: AtomicI64,
}

impl SseTransport {
    /// Opens the event stream, waits for the server-status event, then
    /// discovers tools through the `/message` endpoint.
    pub async fn connect(url: &str, headers: HeaderMap) -> Result<Self> {
        info!("connecting via SSE: {url}");
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeErr::UnexpectedStatus(status, body));
        }
        info!("SSE connected (status {status})");

        let mut events = response.bytes_stream().eventsource();
        loop {
            match events.next().await {
                Some(Ok(event)) => match serde_json::from_str::<Value>(&event.data) {
                    Ok(data) => {
                        if data.get("type").and_then(Value::as_str) == Some("connection") {
                            info!(
                                "server status: {}, tools: {}",
                                data.get("status").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                                data.get("tools").and_then(serde_json::Value::as_i64).unwrap_or(0)
                            );
                        }
                        break;
                    }
                    Err(err) => {
                        warn!("invalid JSON in SSE event: {err}");
                    }
                },
                Some(Err(err)) => return Err(BridgeErr::Protocol(err.to_string())),
                None => return Err(BridgeErr::StreamClosed),
            }
        }

        // Anything after the status event is an upstream notification;
        // drain them so the connection stays alive.
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => debug!("SSE notification: {}", event.data),
                    Err(err) => {
                        debug!("SSE stream ended: {err}");
                        break;
                    }
                }
            }
        });

        let mut transport = Self {
            client,
            message_url: message_endpoint(url),
            tools: Vec::new(),
            next_id: AtomicI64::new(1),
        };
        transport.discover_tools().await?;
        Ok(transport)
    }

    async fn discover_tools(&mut self) -> Result<()> {
        let result = self.post_request("tools/list", json!({})).await?;
        if let Some(tools) = result.get("tools").and_then(Value::as_array) {
            self.tools = tools.clone();
            let names: Vec<&str> = self
                .tools
                .iter()
                .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                .collect();
            info!("discovered {} tools: {names:?}", self.tools.len());
        }
        Ok(())
    }

    async fn post_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.message_url)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeErr::UnexpectedStatus(status, body));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error") {
            return Err(BridgeErr::Protocol(error.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    pub fn tools(&self) -> Vec<Value> {
        self.tools.clone()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        debug!("calling tool '{name}' over SSE transport");
        self.post_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }
}

/// POST endpoint sibling of the SSE stream: every `/sse` occurrence is
/// rewritten to `/message`; URLs without one are reused as-is.
pub(crate) fn message_endpoint(url: &str) -> String {
    url.replace("/sse", "/message")
}
