use std::path::PathBuf;
use std::time::Duration;

use crate::flags;
use crate::policy::PolicyTier;

/// Gateway-wide configuration, constructed once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root under which per-user workspaces are created.
    pub workspaces_root: PathBuf,

    /// Path to the agent CLI binary.
    pub agent_bin: PathBuf,

    /// Path to the bridge proxy binary that gets deployed into the
    /// workspace of any user with remote MCP servers configured.
    pub bridge_bin: PathBuf,

    /// Policy tier applied when the caller does not override permissions.
    pub policy_tier: PolicyTier,

    /// Wall-clock limit for single-shot runs.
    pub agent_timeout: Duration,

    /// Pool entries idle for longer than this are reaped.
    pub max_idle_time: Duration,

    /// Reaper wake interval.
    pub cleanup_interval: Duration,
}

impl GatewayConfig {
    pub fn new(
        workspaces_root: impl Into<PathBuf>,
        agent_bin: impl Into<PathBuf>,
        bridge_bin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspaces_root: workspaces_root.into(),
            agent_bin: agent_bin.into(),
            bridge_bin: bridge_bin.into(),
            policy_tier: PolicyTier::Standard,
            agent_timeout: *flags::RELAY_AGENT_TIMEOUT_MS,
            max_idle_time: *flags::RELAY_POOL_MAX_IDLE_MS,
            cleanup_interval: *flags::RELAY_POOL_CLEANUP_INTERVAL_MS,
        }
    }
}
