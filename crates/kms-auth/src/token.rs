//! Unauthenticated calls to the credential authority
//!
//! Login, registration and token refresh all answer with the same token
//! envelope. None of these calls carry a bearer credential, so they bypass
//! the session pipeline and go straight through `reqwest`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::constants::{BEARER, LOGIN_PATH, REFRESH_PATH, REGISTER_PATH};
use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

/// Token envelope returned by login, register and refresh.
///
/// Login and register also include a `user` summary and a `message`; those
/// are ignored.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    BEARER.to_string()
}

impl TokenResponse {
    /// Validate the envelope and turn it into a credential pair.
    pub fn into_pair(self) -> Result<CredentialPair> {
        if !self.token_type.eq_ignore_ascii_case(BEARER) {
            return Err(Error::TokenExchange(format!(
                "unsupported token type {:?}",
                self.token_type
            )));
        }
        if self.access_token.is_empty() || self.refresh_token.is_empty() {
            return Err(Error::TokenExchange(
                "token envelope is missing a token".into(),
            ));
        }
        Ok(CredentialPair::bearer(self.access_token, self.refresh_token))
    }
}

/// Registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub office_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

/// Profile of the authenticated user (`GET /users/me`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub office_location: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    pub role: String,
    pub is_active: bool,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

/// Client for the authority's unauthenticated endpoints.
#[derive(Debug, Clone)]
pub struct Authority {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Authority {
    /// `base_url` is the API root, e.g. `http://localhost:8000/api/v1`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            timeout,
        }
    }

    /// API root without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join an endpoint path onto the API root.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// Log in with username and password.
    ///
    /// 401 → `InvalidCredentials`, 422 → `Validation`.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialPair> {
        let body = LoginBody { username, password };
        let envelope = self.post_for_tokens(LOGIN_PATH, &body, "login").await?;
        envelope.into_pair()
    }

    /// Register a new user; the authority logs them in immediately.
    ///
    /// A duplicate username or email (400 or 409) is reported as `Conflict`.
    #[instrument(skip_all, fields(username = %user.username))]
    pub async fn register(&self, user: &NewUser) -> Result<CredentialPair> {
        let envelope = match self.post_for_tokens(REGISTER_PATH, user, "register").await {
            Err(Error::BadRequest(msg)) => return Err(Error::Conflict(msg)),
            other => other?,
        };
        envelope.into_pair()
    }

    /// Exchange a refresh token for a rotated pair.
    ///
    /// 401/403 means the refresh token is invalid, expired or revoked.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair> {
        let body = RefreshBody { refresh_token };
        let envelope = self.post_for_tokens(REFRESH_PATH, &body, "refresh").await?;
        envelope.into_pair()
    }

    async fn post_for_tokens<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        context: &str,
    ) -> Result<TokenResponse> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&format!("{context} request failed"), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            debug!(%status, context, "authority rejected request");
            return Err(Error::from_status(status.as_u16(), &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest(&format!("{context} response read failed"), e))?;
        serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|e| Error::TokenExchange(format!("invalid {context} response: {e}")))
    }
}
