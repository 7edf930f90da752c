use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::GatewayErr;
use crate::error::Result;

/// Number of hex characters kept from the token digest.
const IDENTITY_LEN: usize = 16;

/// Anonymous per-user identity derived from the access token. Used as the
/// workspace directory name and the pool key, so it must never contain a
/// path separator or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Pure function of the token: the first 16 hex characters of
    /// SHA-256(token). Stable across restarts, so a user keeps their
    /// workspace as long as their token does not rotate.
    pub fn from_token(access_token: &str) -> Self {
        let digest = Sha256::digest(access_token.as_bytes());
        let mut hex = String::with_capacity(IDENTITY_LEN);
        for byte in digest.iter().take(IDENTITY_LEN / 2) {
            // Writing to a String cannot fail.
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Accepts an identity that arrived as a plain string, e.g. on an
    /// administrative surface. Only lowercase hex of the expected length
    /// is valid, which rules out path traversal by construction.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.len() == IDENTITY_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(GatewayErr::Security(format!(
                "invalid user identity: {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines; the full value is a directory name and
    /// does not belong in operator-visible output.
    pub fn masked(&self) -> String {
        format!("{}...", &self.0[..8])
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
