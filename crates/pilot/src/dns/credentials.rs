//! DNS API credential loading.
//!
//! Credentials live in a JSON file outside the repository and are read
//! once at startup. Secret material is kept out of Debug output and is
//! never logged.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use super::provider::{DnsProviderError, DnsResult};

/// Secret material for a DNS API, in one of the supported shapes.
#[derive(Clone)]
pub enum Credentials {
    /// Single bearer token
    Token(String),
    /// API key plus secret pair
    KeySecret { key: String, secret: String },
}

impl Credentials {
    /// Value for an `Authorization: Bearer` header.
    pub fn bearer_token(&self) -> String {
        match self {
            Credentials::Token(token) => token.clone(),
            Credentials::KeySecret { key, secret } => format!("{key}:{secret}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Credentials::Token(<redacted>)"),
            Credentials::KeySecret { .. } => f.write_str("Credentials::KeySecret(<redacted>)"),
        }
    }
}

/// A loaded credential record: the secret plus an optional zone scope
/// restricting which domains it may manage.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub credentials: Credentials,
    pub scope: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialFile {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    zone: Option<String>,
}

/// Load credentials from a JSON file.
///
/// Accepted shapes:
/// * `{"token": "..."}`
/// * `{"api_key": "...", "api_secret": "..."}`
///
/// Either may carry an optional `"zone"` scope. File permissions wider
/// than owner-only get a warning but do not fail the load.
pub fn load_credentials(path: &Path) -> DnsResult<CredentialRecord> {
    let raw = fs::read_to_string(path).map_err(|e| {
        DnsProviderError::Credentials(format!(
            "cannot read credentials file '{}': {}",
            path.display(),
            e
        ))
    })?;

    check_permissions(path);

    let parsed: CredentialFile = serde_json::from_str(&raw).map_err(|e| {
        DnsProviderError::Credentials(format!(
            "invalid credentials file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let credentials = match (parsed.token, parsed.api_key, parsed.api_secret) {
        (Some(token), None, None) => {
            if token.trim().is_empty() {
                return Err(DnsProviderError::Credentials("empty token".into()));
            }
            Credentials::Token(token.trim().to_string())
        }
        (None, Some(key), Some(secret)) => Credentials::KeySecret {
            key: key.trim().to_string(),
            secret: secret.trim().to_string(),
        },
        (None, Some(_), None) | (None, None, Some(_)) => {
            return Err(DnsProviderError::Credentials(
                "api_key and api_secret must both be present".into(),
            ));
        }
        (Some(_), _, _) => {
            return Err(DnsProviderError::Credentials(
                "provide either token or api_key/api_secret, not both".into(),
            ));
        }
        (None, None, None) => {
            return Err(DnsProviderError::Credentials(
                "credentials file contains no token or api_key/api_secret".into(),
            ));
        }
    };

    Ok(CredentialRecord {
        credentials,
        scope: parsed.zone,
    })
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "credentials file is readable by group/other, consider chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}
