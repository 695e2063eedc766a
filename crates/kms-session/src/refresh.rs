//! Single-flight token refresh
//!
//! However many requests see a 401 at once, at most one refresh call is in
//! flight. The first caller spawns the refresh as its own task and parks a
//! `watch` receiver in the in-flight slot; later callers clone that receiver
//! and wait for the same outcome.
//!
//! The refresh runs on a spawned task so a caller that gives up (dropped
//! future, client timeout) does not cancel the refresh for everyone else.

use std::sync::Arc;
use std::time::Duration;

use kms_auth::{Authority, CredentialPair};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::state::SessionState;

type Outcome = Option<Result<CredentialPair>>;

/// Deduplicates concurrent refresh attempts.
///
/// Cheap to clone; clones share the in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    authority: Authority,
    session: Arc<SessionState>,
    timeout: Duration,
    in_flight: Mutex<Option<watch::Receiver<Outcome>>>,
}

impl RefreshCoordinator {
    pub fn new(authority: Authority, session: Arc<SessionState>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                authority,
                session,
                timeout,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Refresh the stored pair, or join the refresh already in flight.
    ///
    /// Fails with `NoRefreshToken` without any network call when the store
    /// is empty. On failure the store has been cleared and the session is
    /// `Unauthenticated`.
    pub async fn refresh(&self) -> Result<CredentialPair> {
        self.refresh_after(None).await
    }

    /// Like `refresh`, for a caller whose request was rejected while using
    /// `stale_access`.
    ///
    /// If the store already holds a different access token, another caller
    /// finished a refresh after this one dispatched; the stored pair is
    /// returned without a network call.
    pub async fn refresh_after(&self, stale_access: Option<&str>) -> Result<CredentialPair> {
        let mut rx = {
            let mut slot = self.inner.in_flight.lock().await;
            match slot.as_ref() {
                Some(rx) => {
                    debug!("joining in-flight refresh");
                    metrics::record_refresh_joined();
                    rx.clone()
                }
                None => {
                    let (epoch, current) = self.inner.session.snapshot().await;
                    let pair = match current {
                        Some(pair) if pair.has_refresh_token() => pair,
                        _ => {
                            debug!("no refresh token stored, skipping refresh");
                            return Err(Error::NoRefreshToken);
                        }
                    };

                    if let Some(stale) = stale_access {
                        if pair.access_token.expose() != stale {
                            debug!("access token already rotated, reusing stored pair");
                            return Ok(pair);
                        }
                    }

                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.run(epoch, pair, tx).await;
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::RefreshFailed("refresh task ended without a result".into()))?
            .clone();
        outcome.unwrap_or_else(|| Err(Error::RefreshFailed("refresh produced no outcome".into())))
    }

    /// Whether a refresh is currently running.
    pub async fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().await.is_some()
    }
}

impl Inner {
    /// `epoch` is the one `pair` was read under, not the one current when
    /// the task first runs.
    async fn run(&self, epoch: u64, pair: CredentialPair, tx: watch::Sender<Outcome>) {
        let result = if self.session.begin_refresh(epoch).await {
            info!("refreshing access token");
            self.exchange(epoch, pair).await
        } else {
            metrics::record_refresh("superseded");
            Err(Error::RefreshFailed(
                "session changed before the refresh started".into(),
            ))
        };

        // Clear the slot before publishing so late arrivals take the
        // stale-token path against the committed pair.
        self.in_flight.lock().await.take();
        tx.send_replace(Some(result));
    }

    async fn exchange(&self, epoch: u64, pair: CredentialPair) -> Result<CredentialPair> {
        let call = self.authority.refresh(pair.refresh_token.expose());
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(new_pair)) => {
                if self.session.commit_refresh(epoch, new_pair.clone()).await {
                    info!("token refresh succeeded");
                    metrics::record_refresh("success");
                    Ok(new_pair)
                } else {
                    metrics::record_refresh("superseded");
                    Err(Error::RefreshFailed(
                        "session changed while the refresh was in flight".into(),
                    ))
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "token refresh failed, clearing session");
                self.session.abandon_refresh(epoch).await;
                metrics::record_refresh("rejected");
                Err(Error::RefreshFailed(e.to_string()))
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "token refresh timed out, clearing session");
                self.session.abandon_refresh(epoch).await;
                metrics::record_refresh("timeout");
                Err(Error::RefreshTimeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AuthState;
    use crate::testing::MockAuthority;
    use kms_auth::{MemoryTokenStore, TokenStore};

    async fn coordinator(
        mock: &MockAuthority,
        store: Arc<dyn TokenStore>,
        timeout: Duration,
    ) -> (RefreshCoordinator, Arc<SessionState>) {
        let session = Arc::new(SessionState::new(store).await);
        let authority = Authority::new(reqwest::Client::new(), mock.url(), Duration::from_secs(5));
        (
            RefreshCoordinator::new(authority, session.clone(), timeout),
            session,
        )
    }

    #[tokio::test]
    async fn no_refresh_token_fails_without_network_call() {
        let mock = MockAuthority::start().await;
        let (coordinator, _) =
            coordinator(&mock, Arc::new(MemoryTokenStore::new()), Duration::from_secs(5)).await;

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken), "got: {err:?}");
        assert_eq!(mock.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn success_rotates_store_and_authenticates() {
        let mock = MockAuthority::start().await;
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, session) = coordinator(&mock, store.clone(), Duration::from_secs(5)).await;

        let pair = coordinator.refresh().await.unwrap();
        assert_eq!(pair.access_token.expose(), "A2");
        assert_eq!(pair.refresh_token.expose(), "R2");

        let stored = store.get().await.unwrap();
        assert_eq!(stored, pair);
        assert_eq!(session.current(), AuthState::Authenticated);
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn rejected_refresh_clears_store() {
        let mock = MockAuthority::start().await;
        mock.invalidate_refresh_tokens();
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, session) = coordinator(&mock, store.clone(), Duration::from_secs(5)).await;

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got: {err:?}");
        assert!(store.get().await.is_none());
        assert_eq!(session.current(), AuthState::Unauthenticated);
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_call() {
        let mock = MockAuthority::start().await;
        mock.set_refresh_delay(Duration::from_millis(150));
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, _) = coordinator(&mock, store, Duration::from_secs(5)).await;

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.refresh().await }));
        }
        for h in handles {
            let pair = h.await.unwrap().unwrap();
            assert_eq!(pair.access_token.expose(), "A2");
        }
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn stale_access_token_reuses_rotated_pair() {
        let mock = MockAuthority::start().await;
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A2", "R2")));
        let (coordinator, _) = coordinator(&mock, store, Duration::from_secs(5)).await;

        let pair = coordinator.refresh_after(Some("A1")).await.unwrap();
        assert_eq!(pair.access_token.expose(), "A2");
        assert_eq!(mock.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn timeout_fails_and_clears_store() {
        let mock = MockAuthority::start().await;
        mock.set_refresh_delay(Duration::from_secs(2));
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, session) =
            coordinator(&mock, store.clone(), Duration::from_millis(100)).await;

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshTimeout(_)), "got: {err:?}");
        assert!(store.get().await.is_none());
        assert_eq!(session.current(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_cancel_refresh() {
        let mock = MockAuthority::start().await;
        mock.set_refresh_delay(Duration::from_millis(200));
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, _) = coordinator(&mock, store.clone(), Duration::from_secs(5)).await;

        // First caller starts the refresh, then gives up
        let impatient = coordinator.clone();
        let abandoned = tokio::time::timeout(Duration::from_millis(20), async move {
            impatient.refresh().await
        })
        .await;
        assert!(abandoned.is_err());

        // Second caller joins the same refresh and gets its result
        let pair = coordinator.refresh().await.unwrap();
        assert_eq!(pair.access_token.expose(), "A2");
        assert_eq!(mock.refresh_calls(), 1);
        assert_eq!(store.get().await.unwrap().access_token.expose(), "A2");
    }

    #[tokio::test]
    async fn logout_during_refresh_stays_logged_out() {
        let mock = MockAuthority::start().await;
        mock.set_refresh_delay(Duration::from_millis(150));
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, session) = coordinator(&mock, store.clone(), Duration::from_secs(5)).await;

        let refreshing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.terminate().await;

        let err = refreshing.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got: {err:?}");
        assert!(store.get().await.is_none());
        assert_eq!(session.current(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn logout_before_refresh_task_starts_stays_logged_out() {
        let mock = MockAuthority::start().await;
        let store: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::with_pair(CredentialPair::bearer("A1", "R1")));
        let (coordinator, session) = coordinator(&mock, store.clone(), Duration::from_secs(5)).await;

        // One poll spawns the refresh task without letting it run
        let mut refreshing = Box::pin(coordinator.refresh());
        assert!(futures_util::poll!(refreshing.as_mut()).is_pending());
        session.terminate().await;

        let err = refreshing.await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got: {err:?}");
        assert!(store.get().await.is_none(), "logout must not be undone by the refresh");
        assert_eq!(session.current(), AuthState::Unauthenticated);
        assert_eq!(mock.refresh_calls(), 0);
        assert!(!coordinator.is_refreshing().await);
    }
}
