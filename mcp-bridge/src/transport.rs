use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Value;

use crate::error::BridgeErr;
use crate::error::Result;
use crate::sse::SseTransport;
use crate::streamable_http::StreamableHttpTransport;

/// Downstream connection to the remote tool server.
pub enum RemoteTransport {
    Sse(SseTransport),
    StreamableHttp(StreamableHttpTransport),
}

impl RemoteTransport {
    /// Tool descriptors cached during the downstream handshake.
    pub fn tools(&self) -> Vec<Value> {
        match self {
            RemoteTransport::Sse(transport) => transport.tools(),
            RemoteTransport::StreamableHttp(transport) => transport.tools(),
        }
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        match self {
            RemoteTransport::Sse(transport) => transport.call_tool(name, arguments).await,
            RemoteTransport::StreamableHttp(transport) => {
                transport.call_tool(name, arguments).await
            }
        }
    }
}

/// Default header set for the downstream HTTP client: the bearer token (if
/// any) plus the caller's extra headers.
pub fn build_header_map(bearer: Option<&str>, extra: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| BridgeErr::Header(err.to_string()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| BridgeErr::Header(format!("{name}: {err}")))?;
        let value =
            HeaderValue::from_str(value).map_err(|err| BridgeErr::Header(err.to_string()))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
