//! Error types for authenticated client operations

use std::time::Duration;

/// Errors from the session layer.
///
/// `Clone` so one refresh outcome can be delivered to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no refresh token stored")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Authority(#[from] kms_auth::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller should send the user back to login.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Error::NoRefreshToken
                | Error::RefreshFailed(_)
                | Error::RefreshTimeout(_)
                | Error::AuthenticationRequired(_)
        )
    }
}
