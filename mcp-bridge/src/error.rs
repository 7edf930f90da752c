use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeErr>;

#[derive(Error, Debug)]
pub enum BridgeErr {
    /// Unexpected HTTP status from the remote server.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// The remote stream closed while a response was still pending.
    #[error("remote stream closed unexpectedly")]
    StreamClosed,

    /// The remote server replied with something other than the expected
    /// JSON-RPC shape, or with a JSON-RPC error object.
    #[error("remote protocol error: {0}")]
    Protocol(String),

    /// A caller-supplied header could not be encoded.
    #[error("invalid header: {0}")]
    Header(String),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
