//! Wire shapes shared between the dispatcher, the pool and the agent's
//! stream-json protocol.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

/// Conversation roles accepted from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn of caller-supplied conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// One line of the agent's stream-json stdin.
pub fn input_frame(message: &AgentMessage) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": message.role.as_str(),
            "content": message.content,
        },
    })
}

/// The agent's end-of-turn marker on its stream-json stdout.
pub fn is_result_event(event: &Value) -> bool {
    event.get("type").and_then(Value::as_str) == Some("result")
}

/// Synthetic error event surfaced to streaming callers in place of a
/// propagated error.
pub fn error_event(message: &str, code: &str) -> Value {
    json!({
        "type": "error",
        "error": { "message": message, "code": code },
    })
}

/// Envelope for single-shot stdout that was not itself valid JSON.
pub fn text_envelope(text: &str, model: &str) -> Value {
    json!({
        "type": "message",
        "content": [{ "type": "text", "text": text }],
        "model": model,
        "usage": {},
    })
}
