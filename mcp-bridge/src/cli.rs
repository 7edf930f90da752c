use clap::Parser;
use clap::ValueEnum;

/// Bridges a remote MCP tool server onto the stdio channel the agent
/// speaks. Exactly one of `--sse` / `--streamableHttp` selects the
/// downstream transport.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// SSE endpoint of the remote server (e.g. https://host/sse).
    #[arg(
        long = "sse",
        value_name = "URL",
        conflicts_with = "streamable_http",
        required_unless_present = "streamable_http"
    )]
    pub sse: Option<String>,

    /// Streamable HTTP base URL of the remote server.
    #[arg(long = "streamableHttp", value_name = "URL")]
    pub streamable_http: Option<String>,

    /// Request path appended to the Streamable HTTP base URL.
    #[arg(long = "streamableHttpPath", value_name = "PATH", default_value = "/mcp")]
    pub streamable_http_path: String,

    /// Bearer token sent in the Authorization header.
    #[arg(long = "oauth2Bearer", value_name = "TOKEN")]
    pub oauth2_bearer: Option<String>,

    /// Extra header in "Key: Value" form. Repeatable.
    #[arg(long = "header", value_name = "K: V")]
    pub headers: Vec<String>,

    /// MCP protocol version advertised to both sides.
    #[arg(long = "protocolVersion", default_value = "2024-11-05")]
    pub protocol_version: String,

    /// Diagnostic verbosity on stderr. stdout is reserved for the
    /// protocol.
    #[arg(long = "logLevel", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    None,
}

impl Cli {
    /// Splits each repeated `--header "Key: Value"` on the first colon.
    /// Entries without a colon are ignored.
    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|header| {
                header
                    .split_once(':')
                    .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    #[expect(clippy::unwrap_used)]
    fn parses_streamable_http_invocation() {
        let cli = Cli::try_parse_from([
            "relay-mcp-bridge",
            "--streamableHttp",
            "https://h/",
            "--oauth2Bearer",
            "tok",
            "--protocolVersion",
            "2024-11-05",
            "--logLevel",
            "info",
        ])
        .unwrap();
        assert_eq!(cli.streamable_http.as_deref(), Some("https://h/"));
        assert_eq!(cli.streamable_http_path, "/mcp");
        assert_eq!(cli.oauth2_bearer.as_deref(), Some("tok"));
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn parses_sse_invocation_with_headers() {
        let cli = Cli::try_parse_from([
            "relay-mcp-bridge",
            "--sse",
            "https://h/sse",
            "--header",
            "X-First: one",
            "--header",
            "X-Second:two",
            "--header",
            "garbage-without-colon",
        ])
        .unwrap();
        assert_eq!(cli.sse.as_deref(), Some("https://h/sse"));
        assert_eq!(
            cli.parsed_headers(),
            vec![
                ("X-First".to_string(), "one".to_string()),
                ("X-Second".to_string(), "two".to_string()),
            ]
        );
    }

    #[test]
    fn requires_one_transport() {
        assert!(Cli::try_parse_from(["relay-mcp-bridge"]).is_err());
    }

    #[test]
    fn rejects_both_transports() {
        assert!(
            Cli::try_parse_from([
                "relay-mcp-bridge",
                "--sse",
                "https://a/sse",
                "--streamableHttp",
                "https://b/",
            ])
            .is_err()
        );
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn log_level_defaults_to_info() {
        let cli = Cli::try_parse_from(["relay-mcp-bridge", "--sse", "https://h/sse"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.protocol_version, "2024-11-05");
    }
}
