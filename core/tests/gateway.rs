//! End-to-end dispatcher scenarios against stub agents: argument vector
//! assembly, isolation invariants on disk, session resume, remote MCP
//! wiring, streaming modes.

#![expect(clippy::unwrap_used)]

mod common;

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use relay_core::CredentialBundle;
use relay_core::Gateway;
use relay_core::GatewayConfig;
use relay_core::GatewayErr;
use relay_core::McpServerSpec;
use relay_core::McpTransport;
use relay_core::MessageRequest;
use relay_core::UserIdentity;
use relay_core::protocol::AgentMessage;
use serde_json::Value;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    gateway: Gateway,
    workspaces_root: std::path::PathBuf,
}

fn harness(agent_script: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let agent_bin = common::write_stub(dir.path(), "agent", agent_script);
    let bridge_bin = common::write_stub(dir.path(), "bridge", "#!/bin/sh\nexit 0\n");
    let workspaces_root = dir.path().join("workspaces");
    let config = GatewayConfig::new(&workspaces_root, agent_bin, bridge_bin);
    let gateway = Gateway::new(config).unwrap();
    Harness {
        _dir: dir,
        gateway,
        workspaces_root,
    }
}

fn bundle() -> CredentialBundle {
    CredentialBundle::new("sk-gateway-test-token")
}

fn workspace_of(root: &Path, token: &str) -> std::path::PathBuf {
    root.join(UserIdentity::from_token(token).as_str())
}

fn recorded_args(workspace: &Path) -> Vec<String> {
    fs::read_to_string(workspace.join("args.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_shot_without_mcp() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let mut request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    request.model = "haiku".to_string();

    let envelope = h.gateway.create_message(request).await.unwrap();
    assert_eq!(envelope["content"][0]["text"], "pong");

    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    let args = recorded_args(&workspace);
    assert!(args.contains(&"--model".to_string()));
    assert!(args.contains(&"claude-3-5-haiku-20241022".to_string()));
    assert!(!args.contains(&"--mcp-config".to_string()));
    assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));
    assert_eq!(args.last().map(String::as_str), Some("ping"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_secures_workspace_and_credentials() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    h.gateway.create_message(request).await.unwrap();

    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    assert_eq!(
        fs::metadata(&workspace).unwrap().permissions().mode() & 0o777,
        0o700
    );
    let creds = workspace.join(".claude").join(".credentials.json");
    assert_eq!(fs::metadata(&creds).unwrap().permissions().mode() & 0o777, 0o600);

    let parsed: Value = serde_json::from_str(&fs::read_to_string(&creds).unwrap()).unwrap();
    assert_eq!(parsed["claudeAiOauth"]["accessToken"], "sk-gateway-test-token");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_blob_reaches_the_agent() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    h.gateway.create_message(request).await.unwrap();

    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    let args = recorded_args(&workspace);
    let settings_pos = args.iter().position(|a| a == "--settings").unwrap();
    let settings: Value = serde_json::from_str(&args[settings_pos + 1]).unwrap();
    assert_eq!(settings["credentials"]["access_token"], "sk-gateway-test-token");
    // The standard tier applies when no override is given.
    assert_eq!(settings["permissions"]["defaultMode"], "ask");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_resume_only_after_agent_persisted_it() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");

    let mut request = MessageRequest::new(bundle(), vec![AgentMessage::user("first")]);
    request.session_id = Some("sess-abc123".to_string());
    h.gateway.create_message(request.clone()).await.unwrap();
    assert!(
        !recorded_args(&workspace).contains(&"--resume".to_string()),
        "fresh session must not be resumed"
    );

    // Simulate the agent having persisted the session.
    fs::write(
        workspace.join(".claude").join("history.jsonl"),
        "{\"session\":\"sess-abc123\"}\n",
    )
    .unwrap();

    request.messages = vec![AgentMessage::user("second")];
    h.gateway.create_message(request).await.unwrap();
    let args = recorded_args(&workspace);
    let resume_pos = args.iter().position(|a| a == "--resume").unwrap();
    assert_eq!(args[resume_pos + 1], "sess-abc123");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_mcp_deploys_proxy_and_flags() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let mut request = MessageRequest::new(bundle(), vec![AgentMessage::user("use the tool")]);
    request.mcp_servers = HashMap::from([(
        "n8n".to_string(),
        McpServerSpec::remote("https://h/", McpTransport::StreamableHttp),
    )]);
    h.gateway.create_message(request).await.unwrap();

    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    let proxy = workspace.join("mcp_proxy");
    assert_eq!(fs::metadata(&proxy).unwrap().permissions().mode() & 0o777, 0o700);

    let args = recorded_args(&workspace);
    assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    assert!(args.contains(&"--".to_string()));

    let mcp_pos = args.iter().position(|a| a == "--mcp-config").unwrap();
    let mcp_config: Value = serde_json::from_str(&args[mcp_pos + 1]).unwrap();
    let entry = &mcp_config["mcpServers"]["n8n"];
    assert_eq!(entry["command"], proxy.display().to_string());
    let proxy_args: Vec<&str> = entry["args"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(proxy_args[0], "--streamableHttp");
    assert_eq!(proxy_args[1], "https://h/");
    assert!(proxy_args.contains(&"--protocolVersion"));
    assert!(proxy_args.contains(&"2024-11-05"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_mcp_spec_is_rejected_before_spawn() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let mut bad = McpServerSpec::local("npx", vec![]);
    bad.url = Some("https://h/".to_string());
    let mut request = MessageRequest::new(bundle(), vec![AgentMessage::user("x")]);
    request.mcp_servers = HashMap::from([("bad".to_string(), bad)]);

    let err = h.gateway.create_message(request).await.unwrap_err();
    assert!(matches!(err, GatewayErr::Config(_)));
    // Nothing ran, so nothing was recorded.
    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    assert!(!workspace.join("args.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_failure_surfaces_stderr() {
    let h = harness(common::FAILING_AGENT);
    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    let err = h.gateway.create_message(request).await.unwrap_err();
    match err {
        GatewayErr::AgentExit { code, stderr } => {
            assert_eq!(code, 3);
            assert!(stderr.contains("agent exploded"));
        }
        other => panic!("expected AgentExit, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_shot_timeout_kills_the_agent() {
    let dir = TempDir::new().unwrap();
    let agent_bin = common::write_stub(dir.path(), "agent", common::HANGING_AGENT);
    let bridge_bin = common::write_stub(dir.path(), "bridge", "#!/bin/sh\nexit 0\n");
    let mut config = GatewayConfig::new(dir.path().join("workspaces"), agent_bin, bridge_bin);
    config.agent_timeout = Duration::from_millis(300);
    let gateway = Gateway::new(config).unwrap();

    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    let err = gateway.create_message(request).await.unwrap_err();
    assert!(matches!(err, GatewayErr::Timeout));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_mode_ends_on_result() {
    let h = harness(common::STREAMING_AGENT);
    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    let mut rx = h.gateway.create_message_streaming(request).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert!(!events.is_empty());
    assert_eq!(events.last().unwrap()["type"], "result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pooled_mode_keeps_one_entry_per_user() {
    let h = harness(common::STREAMING_AGENT);

    for _ in 0..2 {
        let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
        let mut rx = h.gateway.create_message_pooled(request).await.unwrap();
        let mut last = Value::Null;
        while let Some(event) = rx.recv().await {
            last = event;
        }
        assert_eq!(last["type"], "result");
    }

    let stats = h.gateway.pool_stats().await;
    assert_eq!(stats.pool_size, 1);
    assert!(stats.entries[0].alive);
    assert!(stats.entries[0].user_id.ends_with("..."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_workspace_requires_confirmation_and_removes_tree() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let request = MessageRequest::new(bundle(), vec![AgentMessage::user("ping")]);
    h.gateway.create_message(request).await.unwrap();

    let workspace = workspace_of(&h.workspaces_root, "sk-gateway-test-token");
    assert!(workspace.exists());

    let err = h
        .gateway
        .destroy_workspace("sk-gateway-test-token", false)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayErr::Config(_)));
    assert!(workspace.exists());

    h.gateway
        .destroy_workspace("sk-gateway-test-token", true)
        .await
        .unwrap();
    assert!(!workspace.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workspace_path_is_stable_per_token() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let first = h.gateway.workspace_path("sk-gateway-test-token").unwrap();
    let second = h.gateway.workspace_path("sk-gateway-test-token").unwrap();
    assert_eq!(first, second);
    let other = h.gateway.workspace_path("sk-another-token").unwrap();
    assert_ne!(first, other);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_access_token_is_rejected() {
    let h = harness(common::SINGLE_SHOT_AGENT);
    let request = MessageRequest::new(CredentialBundle::new(""), vec![AgentMessage::user("x")]);
    let err = h.gateway.create_message(request).await.unwrap_err();
    assert!(matches!(err, GatewayErr::Config(_)));
}
