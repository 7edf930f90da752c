//! Per-user pool of long-lived agent subprocesses.
//!
//! Each entry binds one user identity to one running agent in stream-json
//! mode, together with its reader tasks and event queue. Spawn cost is paid
//! once per user; subsequent requests only pay dispatch cost. A background
//! reaper terminates entries that have been idle too long.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::identity::UserIdentity;
use crate::invocation::InvocationSpec;
use crate::protocol::AgentMessage;
use crate::protocol::error_event;
use crate::protocol::input_frame;
use crate::protocol::is_result_event;

/// How long one queue poll waits before looping.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Grace period between the polite signal and the forced kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A spawned stream-json agent with its I/O plumbing attached: the reader
/// tasks drain stdout into the event queue and stderr into the log. Used
/// both for pool entries and for dedicated single-request streams.
pub(crate) struct AgentStream {
    pub child: Child,
    pub stdin: ChildStdin,
    /// Parsed stdout events. The queue closing is the end-of-stream marker.
    pub events: mpsc::UnboundedReceiver<Value>,
    /// Read failures from the stdout drain task.
    pub errors: mpsc::UnboundedReceiver<String>,
}

pub(crate) fn spawn_stream(spec: &InvocationSpec) -> Result<AgentStream> {
    let args = spec.streaming_args();
    let mut child = spec.command(args, Stdio::piped()).spawn()?;

    let stdin = child.stdin.take().ok_or(GatewayErr::Spawn)?;
    let stdout = child.stdout.take().ok_or(GatewayErr::Spawn)?;
    let stderr = child.stderr.take().ok_or(GatewayErr::Spawn)?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    tokio::spawn(drain_stdout(stdout, event_tx, error_tx));
    tokio::spawn(drain_stderr(stderr));

    Ok(AgentStream {
        child,
        stdin,
        events: event_rx,
        errors: error_rx,
    })
}

async fn drain_stdout(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<Value>,
    errors: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(event) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let preview: String = line.chars().take(100).collect();
                        warn!("unparseable agent event ({err}): {preview}");
                    }
                }
            }
            // EOF: dropping the sender closes the queue, which readers
            // treat as the end-of-stream sentinel.
            Ok(None) => break,
            Err(err) => {
                let _ = errors.send(err.to_string());
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("agent stderr: {line}");
        }
    }
}

/// Serialises each message as one stream-json line and flushes.
pub(crate) async fn write_turn(
    stdin: &mut ChildStdin,
    messages: &[AgentMessage],
) -> std::io::Result<()> {
    for message in messages {
        let mut line = serde_json::to_string(&input_frame(message))
            .map_err(std::io::Error::other)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
    }
    stdin.flush().await
}

/// SIGTERM, a grace period, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("agent did not exit after SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// I/O half of a pool entry. Guarded by its own mutex so turns for the
/// same user are serialised without holding the pool-wide lock.
struct EntryIo {
    stdin: ChildStdin,
    events: mpsc::UnboundedReceiver<Value>,
    errors: mpsc::UnboundedReceiver<String>,
}

struct PoolEntry {
    child: Child,
    pid: Option<u32>,
    io: Arc<Mutex<EntryIo>>,
    session_id: Option<String>,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    /// Milliseconds since the pool epoch; shared with in-flight dispatches.
    last_used: Arc<AtomicU64>,
}

/// Handle a dispatch holds while the pool lock is released.
struct DispatchHandle {
    io: Arc<Mutex<EntryIo>>,
    last_used: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
pub struct PoolEntryStats {
    /// Masked for privacy.
    pub user_id: String,
    pub pid: Option<u32>,
    pub idle_secs: u64,
    pub uptime_secs: u64,
    pub created_at: String,
    pub last_used: String,
    pub alive: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub max_idle_secs: u64,
    pub cleanup_interval_secs: u64,
    pub entries: Vec<PoolEntryStats>,
}

pub struct AgentPool {
    entries: Mutex<HashMap<UserIdentity, PoolEntry>>,
    /// Baseline for the atomic `last_used` stamps.
    epoch: Instant,
    max_idle_time: Duration,
    cleanup_interval: Duration,
}

impl AgentPool {
    pub fn new(max_idle_time: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            max_idle_time,
            cleanup_interval,
        }
    }

    /// Starts the background reaper. Must be called from within a runtime.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "pool reaper started (interval {:?}, max idle {:?})",
                pool.cleanup_interval, pool.max_idle_time
            );
            loop {
                tokio::time::sleep(pool.cleanup_interval).await;
                pool.reap_idle().await;
            }
        });
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Sends one turn to the user's pooled agent, forwarding its events to
    /// `out` until the end-of-turn `result` event or end of stream. The
    /// subprocess stays alive across turns; only a closed stdout stream
    /// drops the entry.
    pub async fn dispatch(
        &self,
        user: &UserIdentity,
        spec: &InvocationSpec,
        session_id: Option<&str>,
        messages: &[AgentMessage],
        out: &mpsc::Sender<Value>,
    ) -> Result<()> {
        // The subprocess can exit between the liveness check and the first
        // stdin write; a broken pipe there gets one respawn-and-retry.
        for attempt in 0..2 {
            let handle = self.acquire(user, spec, session_id).await?;
            let mut io = handle.io.lock().await;

            // Events left over from a turn whose caller went away belong
            // to no one; drop them before starting this turn.
            while let Ok(stale) = io.events.try_recv() {
                debug!("dropping stale event: {}", stale["type"]);
            }

            match write_turn(&mut io.stdin, messages).await {
                Ok(()) => {
                    let outcome = self.forward_events(&handle, &mut io, out).await;
                    drop(io);
                    if matches!(outcome, TurnOutcome::StreamClosed) {
                        warn!("agent stream closed for user {}", user.masked());
                        self.remove(user).await;
                    }
                    return Ok(());
                }
                Err(err) if attempt == 0 => {
                    drop(io);
                    warn!(
                        "stdin write failed for user {} ({err}), respawning once",
                        user.masked()
                    );
                    self.remove(user).await;
                }
                Err(err) => {
                    drop(io);
                    let _ = out
                        .send(error_event(
                            &format!("failed to send message: {err}"),
                            "stdin_error",
                        ))
                        .await;
                    self.remove(user).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Looks up (or creates) the entry for `user` and returns its I/O
    /// handle. The pool lock is held for the lookup and the spawn, never
    /// across subprocess I/O.
    async fn acquire(
        &self,
        user: &UserIdentity,
        spec: &InvocationSpec,
        session_id: Option<&str>,
    ) -> Result<DispatchHandle> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(user) {
            match entry.child.try_wait() {
                Ok(None) => {
                    let idle = self.now_ms().saturating_sub(entry.last_used.load(Ordering::Relaxed));
                    debug!(
                        "reusing pooled agent for user {} (idle {}ms)",
                        user.masked(),
                        idle
                    );
                    entry.last_used.store(self.now_ms(), Ordering::Relaxed);
                    return Ok(DispatchHandle {
                        io: Arc::clone(&entry.io),
                        last_used: Arc::clone(&entry.last_used),
                    });
                }
                Ok(Some(status)) => {
                    warn!(
                        "pooled agent for user {} exited ({status}), respawning",
                        user.masked()
                    );
                    entries.remove(user);
                }
                Err(err) => {
                    warn!(
                        "liveness check failed for user {} ({err}), respawning",
                        user.masked()
                    );
                    entries.remove(user);
                }
            }
        }

        let stream = spawn_stream(spec)?;
        let AgentStream {
            child,
            stdin,
            events,
            errors,
        } = stream;
        let pid = child.id();
        let last_used = Arc::new(AtomicU64::new(self.now_ms()));
        let io = Arc::new(Mutex::new(EntryIo {
            stdin,
            events,
            errors,
        }));
        info!(
            "pooled agent spawned for user {} (pid {pid:?})",
            user.masked()
        );
        entries.insert(
            user.clone(),
            PoolEntry {
                child,
                pid,
                io: Arc::clone(&io),
                session_id: session_id.map(str::to_string),
                created_at: Instant::now(),
                created_at_utc: Utc::now(),
                last_used: Arc::clone(&last_used),
            },
        );

        Ok(DispatchHandle { io, last_used })
    }

    async fn forward_events(
        &self,
        handle: &DispatchHandle,
        io: &mut EntryIo,
        out: &mpsc::Sender<Value>,
    ) -> TurnOutcome {
        loop {
            if let Ok(err) = io.errors.try_recv() {
                let _ = out.send(error_event(&err, "stream_error")).await;
                return TurnOutcome::StreamClosed;
            }

            match timeout(POLL_TIMEOUT, io.events.recv()).await {
                Ok(Some(event)) => {
                    handle.last_used.store(self.now_ms(), Ordering::Relaxed);
                    let is_result = is_result_event(&event);
                    if out.send(event).await.is_err() {
                        // Caller went away; the agent stays pooled and the
                        // reaper owns its fate.
                        return TurnOutcome::CallerGone;
                    }
                    if is_result {
                        return TurnOutcome::Completed;
                    }
                }
                Ok(None) => return TurnOutcome::StreamClosed,
                // Nothing yet. A dead subprocess shows up as a closed
                // queue, so there is no separate liveness poll here.
                Err(_) => continue,
            }
        }
    }

    /// Drops the entry for `user` (if any) and terminates its subprocess.
    pub async fn remove(&self, user: &UserIdentity) {
        let entry = { self.entries.lock().await.remove(user) };
        if let Some(mut entry) = entry {
            terminate_child(&mut entry.child).await;
            debug!("pool entry removed for user {}", user.masked());
        }
    }

    /// One reaper sweep: collect expired entries under the lock, terminate
    /// them outside it.
    async fn reap_idle(&self) {
        let max_idle_ms = self.max_idle_time.as_millis() as u64;
        let now = self.now_ms();

        let expired: Vec<(UserIdentity, PoolEntry)> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<UserIdentity> = entries
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) > max_idle_ms
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        for (user, mut entry) in expired {
            let idle =
                now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) as f64 / 1000.0;
            info!(
                "reaping idle agent for user {} (idle {idle:.1}s, session {:?})",
                user.masked(),
                entry.session_id
            );
            terminate_child(&mut entry.child).await;
        }
    }

    /// Snapshot for operators. Liveness is probed per entry, so this takes
    /// the pool lock briefly.
    pub async fn stats(&self) -> PoolStats {
        let mut entries = self.entries.lock().await;
        let now = self.now_ms();

        let mut stats: Vec<PoolEntryStats> = Vec::with_capacity(entries.len());
        for (user, entry) in entries.iter_mut() {
            let idle_ms = now.saturating_sub(entry.last_used.load(Ordering::Relaxed));
            let last_used_utc = Utc::now()
                - chrono::Duration::from_std(Duration::from_millis(idle_ms))
                    .unwrap_or_else(|_| chrono::Duration::zero());
            stats.push(PoolEntryStats {
                user_id: user.masked(),
                pid: entry.pid,
                idle_secs: idle_ms / 1000,
                uptime_secs: entry.created_at.elapsed().as_secs(),
                created_at: entry
                    .created_at_utc
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                last_used: last_used_utc.to_rfc3339_opts(SecondsFormat::Secs, true),
                alive: matches!(entry.child.try_wait(), Ok(None)),
            });
        }

        PoolStats {
            pool_size: stats.len(),
            max_idle_secs: self.max_idle_time.as_secs(),
            cleanup_interval_secs: self.cleanup_interval.as_secs(),
            entries: stats,
        }
    }
}

enum TurnOutcome {
    /// The agent emitted its `result` event; the subprocess stays alive.
    Completed,
    /// The event queue closed: the subprocess is gone.
    StreamClosed,
    /// The caller stopped listening mid-turn.
    CallerGone,
}
