//! Shared fixtures: tiny shell scripts standing in for the agent CLI so
//! the subprocess plumbing can be exercised without the real binary.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

/// Streaming agent: one assistant event and one `result` per stdin line.
/// The `pid` field lets tests prove subprocess reuse.
pub const STREAMING_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}'
  echo "{\"type\":\"result\",\"subtype\":\"success\",\"pid\":$$}"
done
"#;

/// Streaming agent that serves exactly one turn and then exits.
pub const ONE_TURN_AGENT: &str = r#"#!/bin/sh
IFS= read -r line
echo "{\"type\":\"result\",\"subtype\":\"success\",\"pid\":$$}"
exit 0
"#;

/// Streaming agent that trickles events before the result, slow enough for
/// a caller to walk away mid-turn.
pub const SLOW_STREAMING_AGENT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  for i in 1 2 3 4 5; do
    echo '{"type":"assistant","message":{"content":[{"type":"text","text":"chunk"}]}}'
    sleep 0.1
  done
  echo "{\"type\":\"result\",\"subtype\":\"success\",\"pid\":$$}"
done
"#;

/// Single-shot agent: records its argument vector in the workspace, then
/// prints a JSON envelope.
pub const SINGLE_SHOT_AGENT: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$HOME/args.txt"
echo '{"type":"message","content":[{"type":"text","text":"pong"}],"role":"assistant"}'
"#;

/// Single-shot agent that fails loudly.
pub const FAILING_AGENT: &str = r#"#!/bin/sh
echo "agent exploded" >&2
exit 3
"#;

/// Single-shot agent that never finishes in time.
pub const HANGING_AGENT: &str = r#"#!/bin/sh
sleep 5
"#;

pub fn write_stub(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    #[expect(clippy::unwrap_used)]
    fs::write(&path, script).unwrap();
    #[expect(clippy::unwrap_used)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
