use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_mcp_bridge::cli::Cli;
use relay_mcp_bridge::cli::LogLevel;
use relay_mcp_bridge::server;
use relay_mcp_bridge::sse::SseTransport;
use relay_mcp_bridge::streamable_http::StreamableHttpTransport;
use relay_mcp_bridge::transport;
use relay_mcp_bridge::transport::RemoteTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP protocol, so every diagnostic goes to stderr.
    // RUST_LOG still wins over --logLevel when set.
    let default_filter = match cli.log_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::None => "off",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let headers = transport::build_header_map(cli.oauth2_bearer.as_deref(), &cli.parsed_headers())?;

    let transport = if let Some(url) = &cli.streamable_http {
        RemoteTransport::StreamableHttp(
            StreamableHttpTransport::connect(
                url,
                &cli.streamable_http_path,
                headers,
                &cli.protocol_version,
            )
            .await
            .context("failed to connect to remote MCP server")?,
        )
    } else if let Some(url) = &cli.sse {
        RemoteTransport::Sse(
            SseTransport::connect(url, headers)
                .await
                .context("failed to connect to remote MCP server")?,
        )
    } else {
        // clap enforces one transport; this is unreachable in practice.
        anyhow::bail!("one of --sse or --streamableHttp is required");
    };

    server::run(transport, cli.protocol_version).await?;
    Ok(())
}
