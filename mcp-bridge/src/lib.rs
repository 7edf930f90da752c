//! Bridge between remote MCP tool servers and the stdio MCP channel the
//! agent expects. Upstream (the agent) speaks line-delimited JSON-RPC 2.0
//! over stdin/stdout; downstream is either SSE or Streamable HTTP.

// stdout belongs to the MCP protocol; all diagnostics go through tracing
// to stderr.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cli;
pub mod error;
pub mod jsonrpc;
pub mod server;
pub mod sse;
pub mod streamable_http;
pub mod transport;
