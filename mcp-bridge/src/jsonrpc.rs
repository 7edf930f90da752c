//! Minimal line-delimited JSON-RPC 2.0 shapes for the stdio MCP channel.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request ids may be numbers or strings; the bridge assigns integers to
/// its own downstream requests but echoes whatever the agent sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

/// Incoming frame on stdin. A frame without an `id` is a notification and
/// takes no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Success response frame.
pub fn response_frame(id: RequestId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Error response frame.
pub fn error_frame(id: Option<RequestId>, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}
