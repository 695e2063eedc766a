//! Authentication state machine and the session that owns token writes
//!
//! `AuthState::transition` is pure: it takes an event and returns the next
//! state. `SessionState` applies events while holding the session lock, so the
//! token store and the published state always change together.
//!
//! The session lock also carries an epoch counter. Login and logout bump it;
//! a refresh started under an older epoch is not allowed to write its result.

use std::sync::Arc;
use std::time::Duration;

use kms_auth::{CredentialPair, DEFAULT_REFRESH_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS, TokenStore};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

/// Process-wide authentication state.
///
/// Transitions:
/// - Unauthenticated → Authenticated (login, register)
/// - Authenticated → Refreshing (401 observed, refresh started)
/// - Refreshing → Authenticated (refresh succeeded)
/// - Refreshing → Unauthenticated (refresh failed)
/// - any → Unauthenticated (logout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// Events that drive `AuthState` transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    LoggedIn,
    LoggedOut,
    RefreshStarted,
    RefreshSucceeded,
    RefreshFailed,
}

impl AuthState {
    /// Next state after `event`.
    pub fn transition(self, event: AuthEvent) -> AuthState {
        match (self, event) {
            (_, AuthEvent::LoggedIn) => AuthState::Authenticated,
            (_, AuthEvent::LoggedOut) => AuthState::Unauthenticated,
            (AuthState::Unauthenticated, AuthEvent::RefreshStarted) => AuthState::Unauthenticated,
            (_, AuthEvent::RefreshStarted) => AuthState::Refreshing,
            (_, AuthEvent::RefreshSucceeded) => AuthState::Authenticated,
            (_, AuthEvent::RefreshFailed) => AuthState::Unauthenticated,
        }
    }

    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticated => "authenticated",
            AuthState::Refreshing => "refreshing",
        }
    }
}

/// Library-level client configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API root, e.g. `http://localhost:8000/api/v1`
    pub base_url: String,
    /// Timeout for each API call, including replays
    pub request_timeout: Duration,
    /// Upper bound for one refresh call
    pub refresh_timeout: Duration,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
        }
    }
}

/// Owner of all token store writes and of the published `AuthState`.
///
/// Any number of callers may read the store concurrently; writes go through
/// `establish`, `terminate`, `commit_refresh` and `abandon_refresh`.
pub struct SessionState {
    store: Arc<dyn TokenStore>,
    epoch: Mutex<u64>,
    state_tx: watch::Sender<AuthState>,
}

impl SessionState {
    /// Start `Authenticated` if the store already holds a pair.
    pub async fn new(store: Arc<dyn TokenStore>) -> Self {
        let initial = match store.get().await {
            Some(_) => AuthState::Authenticated,
            None => AuthState::Unauthenticated,
        };
        info!(state = initial.label(), "session initialized");
        let (state_tx, _) = watch::channel(initial);
        Self {
            store,
            epoch: Mutex::new(0),
            state_tx,
        }
    }

    /// The token store. Callers may read; writes belong to this type.
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Current state snapshot.
    pub fn current(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// Store a freshly issued pair after login or registration.
    pub async fn establish(&self, pair: CredentialPair) {
        let mut epoch = self.epoch.lock().await;
        *epoch += 1;
        self.store.set(pair).await;
        self.apply(AuthEvent::LoggedIn);
    }

    /// Drop the session. Idempotent.
    pub async fn terminate(&self) {
        let mut epoch = self.epoch.lock().await;
        *epoch += 1;
        self.store.clear().await;
        self.apply(AuthEvent::LoggedOut);
    }

    /// The stored pair together with the epoch it belongs to, read under the
    /// session lock so a concurrent login or logout cannot fall in between.
    pub async fn snapshot(&self) -> (u64, Option<CredentialPair>) {
        let epoch = self.epoch.lock().await;
        (*epoch, self.store.get().await)
    }

    /// Mark a refresh started under `epoch` as running.
    ///
    /// Returns `false`, without touching the state, if the session changed
    /// since the snapshot was taken.
    pub async fn begin_refresh(&self, epoch: u64) -> bool {
        let current = self.epoch.lock().await;
        if *current != epoch {
            debug!(started = epoch, current = *current, "session changed before refresh started");
            return false;
        }
        self.apply(AuthEvent::RefreshStarted);
        true
    }

    /// Write a refreshed pair, unless the session changed since `epoch`.
    ///
    /// Returns whether the pair was written.
    pub async fn commit_refresh(&self, epoch: u64, pair: CredentialPair) -> bool {
        let current = self.epoch.lock().await;
        if *current != epoch {
            debug!(started = epoch, current = *current, "session changed during refresh, discarding tokens");
            return false;
        }
        self.store.set(pair).await;
        self.apply(AuthEvent::RefreshSucceeded);
        true
    }

    /// Force logout after a failed refresh, unless the session changed since
    /// `epoch`. Returns whether the store was cleared.
    pub async fn abandon_refresh(&self, epoch: u64) -> bool {
        let current = self.epoch.lock().await;
        if *current != epoch {
            debug!(started = epoch, current = *current, "session changed during refresh, keeping tokens");
            return false;
        }
        self.store.clear().await;
        self.apply(AuthEvent::RefreshFailed);
        true
    }

    fn apply(&self, event: AuthEvent) {
        self.state_tx.send_modify(|state| {
            let next = state.transition(event);
            if next != *state {
                debug!(from = state.label(), to = next.label(), ?event, "auth state transition");
            }
            *state = next;
        });
    }
}
