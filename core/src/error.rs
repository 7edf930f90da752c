use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayErr>;

#[derive(Error, Debug)]
pub enum GatewayErr {
    /// A filesystem isolation invariant was violated (permissions or path
    /// containment). Never recovered locally.
    #[error("security violation: {0}")]
    Security(String),

    /// A caller-supplied spec is malformed. Rejected before any subprocess
    /// work happens.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The agent subprocess exited non-zero. Carries the captured stderr so
    /// the caller sees what the agent complained about.
    #[error("agent exited with code {code}: {stderr}")]
    AgentExit { code: i32, stderr: String },

    /// Single-shot wall-clock timeout. The subprocess has been killed.
    #[error("timeout waiting for agent to exit")]
    Timeout,

    /// The agent subprocess could not be spawned with its stdio captured.
    #[error("spawn failed: agent stdio not captured")]
    Spawn,

    /// A stdin write or event delivery failed mid-stream.
    #[error("stream disconnected: {0}")]
    Stream(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
