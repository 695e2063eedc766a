//! Credential pair and its on-disk store
//!
//! The pair is persisted as a JSON object with two keys, `access_token` and
//! `refresh_token`. Writes use atomic temp-file + rename so a crash never
//! leaves one token updated without the other. A tokio Mutex serializes
//! writes from login, logout and refresh.
//!
//! Persistence failures never reach the caller. The in-memory copy is
//! authoritative for the running process; the file only matters for the next
//! start.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::BEARER;
use crate::store::TokenStore;

/// Access and refresh token issued together by the authority.
///
/// Always replaced as a unit. Tokens are wrapped in `Secret` so they never
/// appear in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    /// Always "bearer"
    pub token_type: String,
}

impl CredentialPair {
    /// Build a bearer pair from raw token strings.
    pub fn bearer(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access.into()),
            refresh_token: Secret::new(refresh.into()),
            token_type: BEARER.to_string(),
        }
    }

    /// Whether a refresh token is present (non-empty).
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// On-disk layout. Either key missing means no pair is stored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl PersistedTokens {
    fn into_pair(self) -> Option<CredentialPair> {
        match (self.access_token, self.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some(CredentialPair::bearer(access, refresh))
            }
            _ => None,
        }
    }
}

/// File-backed token store.
///
/// Reads the file once at open time and keeps the pair in memory afterwards.
pub struct FileTokenStore {
    path: PathBuf,
    state: Mutex<Option<CredentialPair>>,
}

impl FileTokenStore {
    /// Open the store at `path`.
    ///
    /// A missing, unreadable or corrupt file yields an empty store; the
    /// problem is logged and the next successful `set` overwrites it.
    pub async fn open(path: PathBuf) -> Self {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<PersistedTokens>(&contents) {
                Ok(persisted) => {
                    let pair = persisted.into_pair();
                    info!(path = %path.display(), present = pair.is_some(), "loaded token file");
                    pair
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "token file is corrupt, ignoring");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "token file not found, starting unauthenticated");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "token file unreadable, ignoring");
                None
            }
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Location of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let persisted = PersistedTokens {
                access_token: Some(pair.access_token.expose().clone()),
                refresh_token: Some(pair.refresh_token.expose().clone()),
            };
            *state = Some(pair);
            if let Err(e) = write_atomic(&self.path, &persisted).await {
                warn!(path = %self.path.display(), error = %e, "failed to persist tokens, keeping them in memory only");
            }
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.take();
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => debug!(path = %self.path.display(), "removed token file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to remove token file");
                }
            }
        })
    }
}

/// Write the token file atomically with 0600 permissions.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The parent directory is created if missing.
async fn write_atomic(path: &Path, data: &PersistedTokens) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir).await?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));
    if let Err(e) = replace_with_tmp(&tmp_path, path, json.as_bytes()).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temporary token file");
            }
        }
        return Err(e);
    }

    debug!(path = %path.display(), "persisted tokens");
    Ok(())
}

async fn replace_with_tmp(tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp_path, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms).await?;
    }

    tokio::fs::rename(tmp_path, path).await
}
