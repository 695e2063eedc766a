//! Consumer-facing authentication surface
//!
//! Login and registration talk to the authority directly; everything that
//! needs a bearer token goes through the `ApiClient` pipeline and therefore
//! benefits from transparent refresh.

use std::sync::Arc;

use kms_auth::{Authority, CHANGE_PASSWORD_PATH, CURRENT_USER_PATH, CredentialPair, NewUser, Profile, TokenStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::pipeline::{ApiClient, ApiRequest};
use crate::refresh::RefreshCoordinator;
use crate::state::{AuthState, SessionConfig, SessionState};

#[derive(Serialize)]
struct ChangePasswordBody<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

/// Login, logout, registration and identity queries for one client process.
pub struct AuthFacade {
    authority: Authority,
    session: Arc<SessionState>,
    client: ApiClient,
}

impl AuthFacade {
    /// Wire up the session, refresh coordinator and pipeline around `store`.
    pub async fn new(config: SessionConfig, store: Arc<dyn TokenStore>) -> Self {
        Self::with_http_client(config, store, reqwest::Client::new()).await
    }

    /// Same as `new`, reusing an existing HTTP client (connection pool).
    pub async fn with_http_client(
        config: SessionConfig,
        store: Arc<dyn TokenStore>,
        http: reqwest::Client,
    ) -> Self {
        let session = Arc::new(SessionState::new(store).await);
        let authority = Authority::new(http.clone(), config.base_url, config.request_timeout);
        let coordinator =
            RefreshCoordinator::new(authority.clone(), session.clone(), config.refresh_timeout);
        let client = ApiClient::new(
            http,
            authority.clone(),
            session.clone(),
            coordinator,
            config.request_timeout,
        );
        Self {
            authority,
            session,
            client,
        }
    }

    /// Pipeline for CRUD consumers (trainings, registrations, users).
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Log in. On failure the stored tokens are left untouched.
    #[instrument(skip_all, fields(username = %username))]
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialPair> {
        let pair = self.authority.login(username, password).await?;
        self.session.establish(pair.clone()).await;
        info!("logged in");
        Ok(pair)
    }

    /// Register and log in as the new user.
    #[instrument(skip_all, fields(username = %user.username))]
    pub async fn register(&self, user: &NewUser) -> Result<CredentialPair> {
        let pair = self.authority.register(user).await?;
        self.session.establish(pair.clone()).await;
        info!("registered and logged in");
        Ok(pair)
    }

    /// Whether an access token is stored. Says nothing about expiry.
    pub async fn is_authenticated(&self) -> bool {
        self.session.store().get().await.is_some()
    }

    /// Profile of the logged-in user, or `None` on any failure.
    pub async fn current_user(&self) -> Option<Profile> {
        match self.client.get_json::<Profile>(CURRENT_USER_PATH).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(error = %e, "could not load current user");
                None
            }
        }
    }

    /// Clear the stored tokens. Idempotent and infallible.
    pub async fn logout(&self) {
        self.session.terminate().await;
        info!("logged out");
    }

    /// Change the password. Returns `false` on any failure. The stored
    /// tokens are not rotated.
    pub async fn change_password(&self, current: &str, new: &str) -> bool {
        let body = ChangePasswordBody {
            current_password: current,
            new_password: new,
        };
        let request = match ApiRequest::post(CHANGE_PASSWORD_PATH).json(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "could not build change-password request");
                return false;
            }
        };
        match self.client.send_json::<serde_json::Value>(request).await {
            Ok(_) => {
                info!("password changed");
                true
            }
            Err(e) => {
                warn!(error = %e, "password change failed");
                false
            }
        }
    }

    /// Current authentication state.
    pub fn state(&self) -> AuthState {
        self.session.current()
    }

    /// Observe state changes, e.g. to redirect to login after a forced logout.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.session.subscribe()
    }
}
