//! Front-facing dispatcher. Every entry point shares the same preamble:
//! derive the identity, secure the workspace, materialise credentials and
//! assemble the settings/MCP documents; the modes differ only in how the
//! agent subprocess is run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::credentials;
use crate::credentials::CredentialBundle;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::identity::UserIdentity;
use crate::invocation;
use crate::invocation::InvocationSpec;
use crate::mcp;
use crate::mcp::McpServerSpec;
use crate::policy::PolicyDocument;
use crate::pool::AgentPool;
use crate::pool::PoolStats;
use crate::pool::spawn_stream;
use crate::pool::terminate_child;
use crate::pool::write_turn;
use crate::protocol::AgentMessage;
use crate::protocol::error_event;
use crate::protocol::is_result_event;
use crate::workspace::WorkspaceManager;

/// Size of the per-request event channels handed to callers.
const CHANNEL_CAPACITY: usize = 128;

/// One conversational request against the gateway.
#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub credentials: CredentialBundle,
    pub messages: Vec<AgentMessage>,
    /// Alias (`opus`/`sonnet`/`haiku`) or concrete model id.
    pub model: String,
    pub session_id: Option<String>,
    /// Auto-generate a session id when none was supplied, so a follow-up
    /// request can resume the conversation.
    pub persist_session: bool,
    pub mcp_servers: HashMap<String, McpServerSpec>,
    /// Replaces the tier-derived permission rules when set.
    pub override_permissions: Option<PolicyDocument>,
}

impl MessageRequest {
    pub fn new(credentials: CredentialBundle, messages: Vec<AgentMessage>) -> Self {
        Self {
            credentials,
            messages,
            model: "sonnet".to_string(),
            session_id: None,
            persist_session: false,
            mcp_servers: HashMap::new(),
            override_permissions: None,
        }
    }
}

struct PreparedRequest {
    user: UserIdentity,
    session_id: Option<String>,
    spec: InvocationSpec,
}

pub struct Gateway {
    config: GatewayConfig,
    workspaces: WorkspaceManager,
    pool: Arc<AgentPool>,
}

impl Gateway {
    /// Must be constructed inside a Tokio runtime: the pool reaper task is
    /// spawned here.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let workspaces = WorkspaceManager::new(&config.workspaces_root)?;
        let pool = Arc::new(AgentPool::new(
            config.max_idle_time,
            config.cleanup_interval,
        ));
        pool.spawn_reaper();
        info!(
            "gateway initialised (workspaces root: {}, policy tier: {:?})",
            config.workspaces_root.display(),
            config.policy_tier
        );
        Ok(Self {
            config,
            workspaces,
            pool,
        })
    }

    /// Shared per-request setup: identity, workspace, credentials on disk,
    /// policy/settings/MCP documents, resolved session.
    fn prepare(&self, request: &MessageRequest) -> Result<PreparedRequest> {
        request.credentials.validate()?;
        for spec in request.mcp_servers.values() {
            spec.validate()?;
        }

        let user = UserIdentity::from_token(&request.credentials.access_token);
        debug!("processing request for user {}", user.masked());

        let workspace = self.workspaces.ensure(&user)?;
        credentials::materialize(&workspace, &request.credentials)?;

        let permissions = match &request.override_permissions {
            Some(doc) => doc.clone(),
            None => PolicyDocument::for_tier(
                self.config.policy_tier,
                self.workspaces.root(),
                &workspace,
            ),
        };
        let settings_json = mcp::build_settings(&request.credentials, Some(&permissions))?;
        let mcp_config_json =
            mcp::build_mcp_config(&workspace, &self.config.bridge_bin, &request.mcp_servers)?;

        let session_id = match (&request.session_id, request.persist_session) {
            (Some(id), _) => Some(id.clone()),
            (None, true) => Some(format!("{}-conv-{}", user.as_str(), Uuid::new_v4())),
            (None, false) => None,
        };
        // `--resume` for a session the agent has never seen makes it abort,
        // so only resume sessions with persisted state on disk.
        let resume_session = session_id
            .as_deref()
            .filter(|id| {
                invocation::session_exists(&workspace.join(credentials::CREDENTIALS_DIR), id)
            })
            .map(str::to_string);
        if let Some(session) = &resume_session {
            debug!("resuming existing session: {session}");
        }

        Ok(PreparedRequest {
            user,
            session_id,
            spec: InvocationSpec {
                agent_bin: self.config.agent_bin.clone(),
                workspace,
                model: request.model.clone(),
                resume_session,
                settings_json,
                mcp_config_json,
            },
        })
    }

    /// Single-shot execution: one subprocess, one JSON envelope back.
    pub async fn create_message(&self, request: MessageRequest) -> Result<Value> {
        let prepared = self.prepare(&request)?;
        invocation::run_single_shot(&prepared.spec, &request.messages, self.config.agent_timeout)
            .await
    }

    /// Streaming execution with a subprocess dedicated to this request.
    /// The subprocess is terminated when the turn completes or the caller
    /// stops listening.
    pub async fn create_message_streaming(
        &self,
        request: MessageRequest,
    ) -> Result<mpsc::Receiver<Value>> {
        let prepared = self.prepare(&request)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let messages = request.messages;
        tokio::spawn(async move {
            run_dedicated_stream(prepared.spec, messages, tx).await;
        });
        Ok(rx)
    }

    /// Streaming execution against the user's pooled subprocess. The
    /// subprocess stays alive afterwards; only the idle reaper terminates
    /// it.
    pub async fn create_message_pooled(
        &self,
        request: MessageRequest,
    ) -> Result<mpsc::Receiver<Value>> {
        let prepared = self.prepare(&request)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pool = Arc::clone(&self.pool);
        let messages = request.messages;
        tokio::spawn(async move {
            let result = pool
                .dispatch(
                    &prepared.user,
                    &prepared.spec,
                    prepared.session_id.as_deref(),
                    &messages,
                    &tx,
                )
                .await;
            if let Err(err) = result {
                error!("pooled request failed: {err}");
                let _ = tx
                    .send(error_event(&err.to_string(), "pooled_request_error"))
                    .await;
            }
        });
        Ok(rx)
    }

    /// Workspace path for a token's owner, creating the tree on first use.
    /// Useful for external filesystem operations such as uploads.
    pub fn workspace_path(&self, access_token: &str) -> Result<PathBuf> {
        let user = UserIdentity::from_token(access_token);
        self.workspaces.ensure(&user)
    }

    /// Destroys a user's workspace, terminating their pooled agent first.
    /// Destructive and irreversible, hence the explicit confirmation.
    pub async fn destroy_workspace(&self, access_token: &str, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(GatewayErr::Config(
                "workspace destruction requires confirm=true".to_string(),
            ));
        }
        let user = UserIdentity::from_token(access_token);
        self.pool.remove(&user).await;
        credentials::destroy(&self.workspaces.get(&user));
        self.workspaces.destroy(&user, true)
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}

/// Drives one dedicated streaming subprocess: send the turn, forward
/// events until `result` or EOF, then terminate the agent in every exit
/// path.
async fn run_dedicated_stream(
    spec: InvocationSpec,
    messages: Vec<AgentMessage>,
    out: mpsc::Sender<Value>,
) {
    let mut stream = match spawn_stream(&spec) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = out
                .send(error_event(&err.to_string(), "spawn_error"))
                .await;
            return;
        }
    };

    if let Err(err) = write_turn(&mut stream.stdin, &messages).await {
        let _ = out
            .send(error_event(
                &format!("failed to send message: {err}"),
                "stdin_error",
            ))
            .await;
        terminate_child(&mut stream.child).await;
        return;
    }

    loop {
        if let Ok(err) = stream.errors.try_recv() {
            let _ = out.send(error_event(&err, "stream_error")).await;
            break;
        }
        match tokio::time::timeout(std::time::Duration::from_millis(100), stream.events.recv())
            .await
        {
            Ok(Some(event)) => {
                let is_result = is_result_event(&event);
                if out.send(event).await.is_err() || is_result {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }

    terminate_child(&mut stream.child).await;
    debug!("dedicated stream finished");
}
