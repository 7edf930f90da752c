use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::ErrorKind;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::workspace::assert_owner_only;
use crate::workspace::create_private_dir;

/// Directory inside the workspace that the agent reads its auth state from.
pub const CREDENTIALS_DIR: &str = ".claude";
pub const CREDENTIALS_FILE: &str = ".credentials.json";

/// Upstream OAuth material supplied by the caller with every request. The
/// gateway never refreshes these tokens; callers must send live ones.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    /// Millisecond epoch at which the access token expires.
    #[serde(default)]
    pub expires_at: i64,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default = "default_subscription_type")]
    pub subscription_type: String,
}

fn default_scopes() -> Vec<String> {
    vec!["user:inference".to_string(), "user:profile".to_string()]
}

fn default_subscription_type() -> String {
    "max".to_string()
}

// Tokens must never reach a log line in full, so Debug redacts them.
impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("subscription_type", &self.subscription_type)
            .finish()
    }
}

impl CredentialBundle {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: String::new(),
            expires_at: 0,
            scopes: default_scopes(),
            subscription_type: default_subscription_type(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(crate::error::GatewayErr::Config(
                "access_token must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// On-disk document the agent expects at `.claude/.credentials.json`.
#[derive(Serialize)]
struct CredentialsFile<'a> {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: OauthSection<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OauthSection<'a> {
    access_token: &'a str,
    refresh_token: &'a str,
    expires_at: i64,
    scopes: &'a [String],
    subscription_type: &'a str,
}

/// Writes the credentials document for one user. The containing directory
/// is created owner-only; the file is opened with mode `0o600` and
/// re-checked afterwards. A file that ends up group- or world-readable
/// fails the request and takes the containing directory with it.
pub fn materialize(workspace: &Path, bundle: &CredentialBundle) -> Result<PathBuf> {
    let claude_dir = workspace.join(CREDENTIALS_DIR);
    create_private_dir(&claude_dir)?;

    let doc = CredentialsFile {
        claude_ai_oauth: OauthSection {
            access_token: &bundle.access_token,
            refresh_token: &bundle.refresh_token,
            expires_at: bundle.expires_at,
            scopes: &bundle.scopes,
            subscription_type: &bundle.subscription_type,
        },
    };
    let json_data = serde_json::to_string_pretty(&doc)?;

    let creds_file = claude_dir.join(CREDENTIALS_FILE);
    let mut options = OpenOptions::new();
    options.truncate(true).write(true).create(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let write_result = (|| -> io::Result<()> {
        let mut file = options.open(&creds_file)?;
        file.write_all(json_data.as_bytes())?;
        file.flush()
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_dir_all(&claude_dir);
        return Err(err.into());
    }

    // The open-time mode only applies to newly created files; a
    // pre-existing loose file keeps its bits and must be rejected.
    if let Err(err) = assert_owner_only(&creds_file) {
        let _ = fs::remove_dir_all(&claude_dir);
        return Err(err);
    }

    debug!("credentials secured: {}", creds_file.display());
    Ok(creds_file)
}

/// Best-effort destruction: overwrite the credential bytes with zeros,
/// unlink, then remove the directory tree. Errors are logged and swallowed;
/// correctness comes from the permissions at creation time, not from
/// cleanup.
pub fn destroy(workspace: &Path) {
    let claude_dir = workspace.join(CREDENTIALS_DIR);
    let creds_file = claude_dir.join(CREDENTIALS_FILE);

    if let Err(err) = zeroize_and_unlink(&creds_file) {
        if err.kind() != ErrorKind::NotFound {
            warn!(
                "failed to overwrite credentials at {}: {err}",
                creds_file.display()
            );
        }
    } else {
        debug!("credentials overwritten: {}", creds_file.display());
    }

    if let Err(err) = fs::remove_dir_all(&claude_dir) {
        if err.kind() != ErrorKind::NotFound {
            warn!(
                "failed to remove credentials dir {}: {err}",
                claude_dir.display()
            );
        }
    }
}

fn zeroize_and_unlink(path: &Path) -> io::Result<()> {
    let len = fs::metadata(path)?.len() as usize;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len])?;
    file.flush()?;
    drop(file);
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            access_token: "sk-test-access".to_string(),
            refresh_token: "sk-test-refresh".to_string(),
            expires_at: 1_755_000_000_000,
            scopes: vec!["user:inference".to_string(), "user:profile".to_string()],
            subscription_type: "max".to_string(),
        }
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn materialize_writes_expected_document() {
        let dir = tempdir().unwrap();
        let creds_file = materialize(dir.path(), &bundle()).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&creds_file).unwrap()).unwrap();
        let oauth = &parsed["claudeAiOauth"];
        assert_eq!(oauth["accessToken"], "sk-test-access");
        assert_eq!(oauth["refreshToken"], "sk-test-refresh");
        assert_eq!(oauth["expiresAt"], 1_755_000_000_000_i64);
        assert_eq!(oauth["scopes"][0], "user:inference");
        assert_eq!(oauth["subscriptionType"], "max");
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn materialize_sets_strict_modes() {
        let dir = tempdir().unwrap();
        let creds_file = materialize(dir.path(), &bundle()).unwrap();

        let file_mode = fs::metadata(&creds_file).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(dir.path().join(CREDENTIALS_DIR))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn materialize_twice_is_stable() {
        let dir = tempdir().unwrap();
        let first = materialize(dir.path(), &bundle()).unwrap();
        let first_content = fs::read_to_string(&first).unwrap();
        let second = materialize(dir.path(), &bundle()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first_content, fs::read_to_string(&second).unwrap());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn group_readable_file_is_rejected_and_dir_removed() {
        let dir = tempdir().unwrap();
        let claude_dir = dir.path().join(CREDENTIALS_DIR);
        create_private_dir(&claude_dir).unwrap();
        let creds_file = claude_dir.join(CREDENTIALS_FILE);
        fs::write(&creds_file, "{}").unwrap();
        fs::set_permissions(&creds_file, fs::Permissions::from_mode(0o640)).unwrap();

        let err = materialize(dir.path(), &bundle()).unwrap_err();
        assert!(matches!(err, crate::error::GatewayErr::Security(_)));
        assert!(!claude_dir.exists());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn destroy_removes_credentials_tree() {
        let dir = tempdir().unwrap();
        materialize(dir.path(), &bundle()).unwrap();

        destroy(dir.path());
        assert!(!dir.path().join(CREDENTIALS_DIR).exists());
    }

    #[test]
    fn destroy_of_missing_tree_is_silent() {
        #[expect(clippy::unwrap_used)]
        let dir = tempdir().unwrap();
        destroy(dir.path());
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let bundle = CredentialBundle::new("");
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let printed = format!("{:?}", bundle());
        assert!(!printed.contains("sk-test-access"));
        assert!(!printed.contains("sk-test-refresh"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn bundle_deserializes_with_defaults() {
        let bundle: CredentialBundle =
            serde_json::from_str(r#"{"access_token": "sk-only-token"}"#).unwrap();
        assert_eq!(bundle.refresh_token, "");
        assert_eq!(bundle.expires_at, 0);
        assert_eq!(bundle.scopes, default_scopes());
        assert_eq!(bundle.subscription_type, "max");
    }
}
