//! MCP server specs and the two JSON documents derived from them: the
//! agent's settings blob and its `mcpServers` configuration.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

use crate::credentials::CredentialBundle;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::policy::PolicyDocument;

/// Name the bridge executable takes inside a user's workspace.
pub const BRIDGE_FILE_NAME: &str = "mcp_proxy";

/// Protocol version the bridge advertises to both sides.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const DEFAULT_STREAMABLE_HTTP_PATH: &str = "/mcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpTransport {
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamableHttp")]
    StreamableHttp,
}

/// One configured MCP server: either a local subprocess the agent spawns
/// directly, or a remote server reached through the bridge proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<McpTransport>,

    #[serde(default = "default_streamable_http_path")]
    pub streamable_http_path: String,

    /// Carried only into the per-user proxy argv, never into shared state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

fn default_streamable_http_path() -> String {
    DEFAULT_STREAMABLE_HTTP_PATH.to_string()
}

impl McpServerSpec {
    pub fn local(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            env: None,
            url: None,
            transport: None,
            streamable_http_path: default_streamable_http_path(),
            bearer_token: None,
        }
    }

    pub fn remote(url: impl Into<String>, transport: McpTransport) -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: None,
            url: Some(url.into()),
            transport: Some(transport),
            streamable_http_path: default_streamable_http_path(),
            bearer_token: None,
        }
    }

    /// Exactly one of `command`/`url` must be set; a URL requires a
    /// transport tag.
    pub fn validate(&self) -> Result<()> {
        match (&self.command, &self.url) {
            (None, None) => Err(GatewayErr::Config(
                "MCP server needs either 'command' or 'url'".to_string(),
            )),
            (Some(_), Some(_)) => Err(GatewayErr::Config(
                "MCP server cannot set both 'command' and 'url'".to_string(),
            )),
            (Some(_), None) => Ok(()),
            (None, Some(_)) => {
                if self.transport.is_none() {
                    return Err(GatewayErr::Config(
                        "'transport' is required when 'url' is set".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn is_remote(&self) -> bool {
        self.url.is_some()
    }
}

/// The `--settings` document: the credential bundle, plus the permission
/// rules when a policy applies.
pub fn build_settings(
    bundle: &CredentialBundle,
    permissions: Option<&PolicyDocument>,
) -> Result<String> {
    #[derive(Serialize)]
    struct Settings<'a> {
        credentials: &'a CredentialBundle,
        #[serde(skip_serializing_if = "Option::is_none")]
        permissions: Option<&'a PolicyDocument>,
    }

    Ok(serde_json::to_string(&Settings {
        credentials: bundle,
        permissions,
    })?)
}

/// Emits the `{"mcpServers": ...}` blob for the agent, deploying the
/// bridge proxy into the workspace for any remote server. Returns `None`
/// when no servers are configured. Server entries are emitted in name
/// order so the same spec map always yields the same JSON.
pub fn build_mcp_config(
    workspace: &Path,
    bridge_bin: &Path,
    servers: &HashMap<String, McpServerSpec>,
) -> Result<Option<String>> {
    if servers.is_empty() {
        return Ok(None);
    }
    for spec in servers.values() {
        spec.validate()?;
    }

    let mut proxy_path: Option<PathBuf> = None;
    let mut entries = serde_json::Map::new();
    let mut names: Vec<&String> = servers.keys().collect();
    names.sort();

    for name in names {
        let spec = &servers[name];
        let entry = if spec.is_remote() {
            let proxy = match &proxy_path {
                Some(path) => path.clone(),
                None => {
                    let path = deploy_bridge(workspace, bridge_bin)?;
                    proxy_path = Some(path.clone());
                    path
                }
            };
            info!(
                "remote MCP server configured: {name} ({:?})",
                spec.transport
            );
            remote_entry(spec, &proxy)
        } else {
            info!("local MCP server configured: {name}");
            local_entry(spec)
        };
        entries.insert(name.clone(), entry);
    }

    let config = json!({ "mcpServers": Value::Object(entries) });
    Ok(Some(serde_json::to_string(&config)?))
}

fn local_entry(spec: &McpServerSpec) -> Value {
    let mut entry = json!({
        "command": spec.command,
        "args": spec.args,
    });
    if let Some(env) = &spec.env {
        // BTreeMap so repeated emissions agree on key order.
        let env: BTreeMap<&String, &String> = env.iter().collect();
        entry["env"] = json!(env);
    }
    entry
}

fn remote_entry(spec: &McpServerSpec, proxy: &Path) -> Value {
    let mut args: Vec<String> = Vec::new();
    match (spec.transport, &spec.url) {
        (Some(McpTransport::Sse), Some(url)) => {
            args.push("--sse".to_string());
            args.push(url.clone());
        }
        (Some(McpTransport::StreamableHttp), Some(url)) => {
            args.push("--streamableHttp".to_string());
            args.push(url.clone());
            if spec.streamable_http_path != DEFAULT_STREAMABLE_HTTP_PATH {
                args.push("--streamableHttpPath".to_string());
                args.push(spec.streamable_http_path.clone());
            }
        }
        // validate() ran before we got here.
        _ => {}
    }
    if let Some(token) = &spec.bearer_token {
        args.push("--oauth2Bearer".to_string());
        args.push(token.clone());
    }
    args.push("--protocolVersion".to_string());
    args.push(MCP_PROTOCOL_VERSION.to_string());
    args.push("--logLevel".to_string());
    args.push("info".to_string());

    json!({
        "command": proxy.display().to_string(),
        "args": args,
    })
}

/// Copies the bridge binary into the workspace with owner-only execute
/// permissions. The per-user copy keeps the proxy (and the bearer token in
/// its argv) inside the isolation boundary.
fn deploy_bridge(workspace: &Path, bridge_bin: &Path) -> Result<PathBuf> {
    let target = workspace.join(BRIDGE_FILE_NAME);
    fs::copy(bridge_bin, &target)?;
    #[cfg(unix)]
    fs::set_permissions(&target, fs::Permissions::from_mode(0o700))?;
    debug!("bridge proxy deployed: {}", target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn bundle() -> CredentialBundle {
        CredentialBundle::new("sk-test-access")
    }

    #[test]
    fn spec_validation_rules() {
        assert!(McpServerSpec::local("npx", vec![]).validate().is_ok());
        assert!(
            McpServerSpec::remote("https://h/", McpTransport::Sse)
                .validate()
                .is_ok()
        );

        let mut both = McpServerSpec::local("npx", vec![]);
        both.url = Some("https://h/".to_string());
        assert!(both.validate().is_err());

        let mut neither = McpServerSpec::local("npx", vec![]);
        neither.command = None;
        assert!(neither.validate().is_err());

        let mut no_transport = McpServerSpec::remote("https://h/", McpTransport::Sse);
        no_transport.transport = None;
        assert!(no_transport.validate().is_err());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn settings_blob_carries_credentials_and_permissions() {
        let policy = PolicyDocument::for_tier(
            crate::policy::PolicyTier::Strict,
            Path::new("/workspaces"),
            Path::new("/workspaces/0123456789abcdef"),
        );
        let settings = build_settings(&bundle(), Some(&policy)).unwrap();
        let parsed: Value = serde_json::from_str(&settings).unwrap();
        assert_eq!(parsed["credentials"]["access_token"], "sk-test-access");
        assert_eq!(parsed["credentials"]["subscription_type"], "max");
        assert_eq!(parsed["permissions"]["defaultMode"], "deny");

        let bare = build_settings(&bundle(), None).unwrap();
        let parsed: Value = serde_json::from_str(&bare).unwrap();
        assert!(parsed.get("permissions").is_none());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn empty_server_map_emits_nothing() {
        let dir = tempdir().unwrap();
        let config = build_mcp_config(dir.path(), Path::new("/nonexistent"), &HashMap::new())
            .unwrap();
        assert!(config.is_none());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn local_server_entry_is_verbatim() {
        let dir = tempdir().unwrap();
        let mut spec = McpServerSpec::local("npx", vec!["-y".to_string(), "server".to_string()]);
        spec.env = Some(HashMap::from([(
            "API_KEY".to_string(),
            "value".to_string(),
        )]));
        let servers = HashMap::from([("files".to_string(), spec)]);

        let config = build_mcp_config(dir.path(), Path::new("/nonexistent"), &servers)
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&config).unwrap();
        let entry = &parsed["mcpServers"]["files"];
        assert_eq!(entry["command"], "npx");
        assert_eq!(entry["args"][0], "-y");
        assert_eq!(entry["env"]["API_KEY"], "value");
        // No proxy deployed for local servers.
        assert!(!dir.path().join(BRIDGE_FILE_NAME).exists());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn remote_server_deploys_proxy_and_builds_argv() {
        let dir = tempdir().unwrap();
        let bridge_bin = dir.path().join("bridge-src");
        fs::write(&bridge_bin, b"#!/bin/sh\n").unwrap();

        let workspace = dir.path().join("ws");
        fs::create_dir(&workspace).unwrap();

        let mut spec = McpServerSpec::remote("https://h/", McpTransport::StreamableHttp);
        spec.bearer_token = Some("jwt-token".to_string());
        let servers = HashMap::from([("n8n".to_string(), spec)]);

        let config = build_mcp_config(&workspace, &bridge_bin, &servers)
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&config).unwrap();
        let entry = &parsed["mcpServers"]["n8n"];

        let proxy = workspace.join(BRIDGE_FILE_NAME);
        assert_eq!(entry["command"], proxy.display().to_string());
        let args: Vec<&str> = entry["args"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(
            args,
            vec![
                "--streamableHttp",
                "https://h/",
                "--oauth2Bearer",
                "jwt-token",
                "--protocolVersion",
                "2024-11-05",
                "--logLevel",
                "info",
            ]
        );

        let mode = fs::metadata(&proxy).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn sse_entry_keeps_custom_path_out_of_argv() {
        let dir = tempdir().unwrap();
        let bridge_bin = dir.path().join("bridge-src");
        fs::write(&bridge_bin, b"#!/bin/sh\n").unwrap();
        let workspace = dir.path().join("ws");
        fs::create_dir(&workspace).unwrap();

        let spec = McpServerSpec::remote("https://h/sse", McpTransport::Sse);
        let servers = HashMap::from([("tools".to_string(), spec)]);
        let config = build_mcp_config(&workspace, &bridge_bin, &servers)
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&config).unwrap();
        let args: Vec<&str> = parsed["mcpServers"]["tools"]["args"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(args[0], "--sse");
        assert_eq!(args[1], "https://h/sse");
        assert!(!args.contains(&"--streamableHttpPath"));
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn emission_is_deterministic() {
        let dir = tempdir().unwrap();
        let servers = HashMap::from([
            (
                "b".to_string(),
                McpServerSpec::local("cmd-b", vec!["x".to_string()]),
            ),
            (
                "a".to_string(),
                McpServerSpec::local("cmd-a", vec!["y".to_string()]),
            ),
        ]);
        let first = build_mcp_config(dir.path(), Path::new("/nonexistent"), &servers)
            .unwrap()
            .unwrap();
        let second = build_mcp_config(dir.path(), Path::new("/nonexistent"), &servers)
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
    }
}
