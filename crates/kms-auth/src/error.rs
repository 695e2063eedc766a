//! Error types for credential authority operations

/// Errors from talking to the credential authority.
///
/// `Clone` because a single refresh outcome is handed to every request that
/// waited on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authority returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Result alias for authority operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a reqwest send/receive failure onto the transport taxonomy.
    pub fn from_reqwest(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(format!("{context}: {err}"))
        } else {
            Error::Transport(format!("{context}: {err}"))
        }
    }

    /// Classify a non-2xx authority response.
    ///
    /// 400 → BadRequest, 401/403 → InvalidCredentials, 409 → Conflict,
    /// 422 → Validation, anything else → Api.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = detail(body);
        match status {
            400 => Error::BadRequest(message),
            401 | 403 => Error::InvalidCredentials(message),
            409 => Error::Conflict(message),
            422 => Error::Validation(message),
            _ => Error::Api { status, message },
        }
    }

    /// Whether this error came from the network rather than the authority.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

/// Extract the human-readable message from an error body.
///
/// The authority answers `{"detail": "..."}` for handled errors and
/// `{"detail": [{"msg": ...}, ...]}` for validation failures. Anything else
/// is returned verbatim.
pub fn detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return fallback(body);
    };
    match value.get("detail") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => {
            let msgs: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if msgs.is_empty() {
                fallback(body)
            } else {
                msgs.join("; ")
            }
        }
        _ => fallback(body),
    }
}

fn fallback(body: &str) -> String {
    if body.trim().is_empty() {
        String::from("<no body>")
    } else {
        body.to_string()
    }
}
