use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

/// How the agent treats tool invocations not matched by an allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefaultMode {
    Deny,
    Ask,
    AcceptEdits,
}

/// Security tier selecting one of the three canned rule sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTier {
    /// Public-facing production: default-deny, reads allowed, writes
    /// confined to the caller's workspace.
    Strict,
    /// Standard production: default-ask, plus self-inspection
    /// (`ps` without arguments, the caller's own /proc entry).
    #[default]
    Standard,
    /// Dev/staging only: broad allow, a short deny list for the
    /// obviously destructive.
    Permissive,
}

/// Declarative tool-permission rules handed to the agent via its settings
/// document. The agent evaluates `deny` before `allowedTools`, which is
/// what makes the self-but-not-others pairs below work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "defaultMode")]
    pub default_mode: DefaultMode,
    #[serde(rename = "allowedTools")]
    pub allowed_tools: Vec<String>,
    pub deny: Vec<String>,
}

impl PolicyDocument {
    pub fn for_tier(tier: PolicyTier, workspaces_root: &Path, workspace: &Path) -> Self {
        match tier {
            PolicyTier::Strict => strict(workspaces_root, workspace),
            PolicyTier::Standard => standard(workspaces_root, workspace),
            PolicyTier::Permissive => permissive(),
        }
    }
}

fn workspace_allow_rules(workspace: &Path) -> Vec<String> {
    let ws = workspace.display();
    vec![
        "Read".to_string(),
        format!("Write({ws}/*)"),
        format!("Edit({ws}/*)"),
        "Bash(git:*)".to_string(),
        "Bash(npm:*)".to_string(),
        "Bash(python:*)".to_string(),
        "Bash(node:*)".to_string(),
        "Bash(pip:*)".to_string(),
    ]
}

fn cross_workspace_deny_rules(workspaces_root: &Path, workspace: &Path) -> Vec<String> {
    let root = workspaces_root.display();
    let ws = workspace.display();
    vec![
        format!("Read({root}/*)!{ws}"),
        format!("Write({root}/*)!{ws}"),
    ]
}

fn strict(workspaces_root: &Path, workspace: &Path) -> PolicyDocument {
    let root = workspaces_root.display();
    let mut deny = vec![
        "Bash(ls:/tmp/*)".to_string(),
        "Bash(cat:/tmp/*)".to_string(),
        "Bash(find:/tmp/*)".to_string(),
        "Read(/tmp/*)".to_string(),
        "Bash(ps:*)".to_string(),
        "Bash(top:*)".to_string(),
        "Read(/proc/*)!(/proc/self/*)".to_string(),
        "Bash(cat:/proc/*)".to_string(),
    ];
    deny.extend(cross_workspace_deny_rules(workspaces_root, workspace));
    deny.push(format!("Bash(ls:{root})"));
    deny.push(format!("Bash(ln:*:{root}/*)"));
    deny.extend([
        "Bash(sudo:*)".to_string(),
        "Bash(chmod:*)".to_string(),
        "Bash(chown:*)".to_string(),
        "Bash(rm:/)*".to_string(),
    ]);

    PolicyDocument {
        default_mode: DefaultMode::Deny,
        allowed_tools: workspace_allow_rules(workspace),
        deny,
    }
}

fn standard(workspaces_root: &Path, workspace: &Path) -> PolicyDocument {
    let mut allowed_tools = workspace_allow_rules(workspace);
    // `ps` with no arguments only lists the caller's own processes.
    allowed_tools.push("Bash(ps)".to_string());
    allowed_tools.push("Read(/proc/self/*)".to_string());

    let mut deny = vec![
        "Bash(cat:/tmp/*)".to_string(),
        "Bash(find:/tmp/*)".to_string(),
        "Read(/tmp/*)".to_string(),
    ];
    deny.extend(cross_workspace_deny_rules(workspaces_root, workspace));
    deny.extend(["Bash(sudo:*)".to_string(), "Bash(rm:/)*".to_string()]);

    PolicyDocument {
        default_mode: DefaultMode::Ask,
        allowed_tools,
        deny,
    }
}

fn permissive() -> PolicyDocument {
    PolicyDocument {
        default_mode: DefaultMode::AcceptEdits,
        allowed_tools: vec![
            "Read".to_string(),
            "Write(*)".to_string(),
            "Edit(*)".to_string(),
            "Bash(*)".to_string(),
        ],
        deny: vec![
            "Bash(sudo:*)".to_string(),
            "Bash(rm:/)*".to_string(),
            "Write(/etc/*)".to_string(),
        ],
    }
}
