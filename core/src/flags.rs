use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Wall-clock limit for single-shot agent runs.
    pub RELAY_AGENT_TIMEOUT_MS: Duration = Duration::from_millis(180_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Pooled agent subprocesses idle for longer than this are reaped.
    pub RELAY_POOL_MAX_IDLE_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// How often the pool reaper wakes.
    pub RELAY_POOL_CLEANUP_INTERVAL_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
