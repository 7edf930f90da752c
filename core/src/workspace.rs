use std::fs;
use std::io::ErrorKind;
#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::identity::UserIdentity;

/// Name of the scratch directory inside each workspace; it becomes the
/// agent's TMPDIR so temp files never land in the shared /tmp.
pub const SCRATCH_DIR: &str = "tmp";

/// Owns the per-user workspace trees under a single root.
///
/// Every workspace is `<root>/<identity>` with owner-only permissions; the
/// root itself is world-readable so unprivileged health checks can stat it.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Creates the root directory (mode `0o755`) if it does not exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let created = !root.exists();
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            builder.mode(0o755);
        }
        builder.create(&root)?;
        // The builder mode is umask-attenuated; pin the advertised mode on
        // the directories this call actually created.
        #[cfg(unix)]
        if created {
            fs::set_permissions(&root, fs::Permissions::from_mode(0o755))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates (or revalidates) the workspace for `user` and returns its
    /// path. The directory and its scratch subdirectory are owner-only;
    /// anything looser is a security failure, not something to repair.
    pub fn ensure(&self, user: &UserIdentity) -> Result<PathBuf> {
        validate_identity_component(user.as_str())?;
        let workspace = self.root.join(user.as_str());
        create_private_dir(&workspace)?;
        create_private_dir(&workspace.join(SCRATCH_DIR))?;
        debug!("workspace secured: {}", workspace.display());
        Ok(workspace)
    }

    /// Read-only accessor; does not touch the filesystem.
    pub fn get(&self, user: &UserIdentity) -> PathBuf {
        self.root.join(user.as_str())
    }

    /// Recursively removes the user's workspace. Destructive and
    /// irreversible, hence the explicit confirmation.
    pub fn destroy(&self, user: &UserIdentity, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(GatewayErr::Config(
                "workspace destruction requires confirm=true".to_string(),
            ));
        }
        validate_identity_component(user.as_str())?;
        let workspace = self.root.join(user.as_str());
        match fs::remove_dir_all(&workspace) {
            Ok(()) => {
                info!("workspace deleted: {}", workspace.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("workspace not found: {}", workspace.display());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Rejects identities that could escape the workspaces root when joined
/// onto it. Derived identities are pure hex, so this only fires for raw
/// strings arriving from administrative surfaces.
pub(crate) fn validate_identity_component(user: &str) -> Result<()> {
    if user.is_empty() || user.contains('/') || user.contains("..") {
        return Err(GatewayErr::Security(format!(
            "invalid user identity: {user:?}"
        )));
    }
    Ok(())
}

/// Creates `path` with mode `0o700` (if absent) and verifies that no
/// group/world bits are set afterwards.
pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        builder.mode(0o700);
    }
    match builder.create(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err.into()),
    }
    assert_owner_only(path)
}

/// Fails with a security error if `path` is readable or writable by group
/// or world. Permissions are checked after creation rather than repaired:
/// a loose mode means something else touched the tree.
pub(crate) fn assert_owner_only(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(GatewayErr::Security(format!(
                "{} has insecure permissions {:o}",
                path.display(),
                mode & 0o7777
            )));
        }
    }
    Ok(())
}
