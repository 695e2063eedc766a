//! Token persistence capability
//!
//! `TokenStore` is injected into the session layer instead of reaching for a
//! global key/value API, so tests can substitute `MemoryTokenStore` and the
//! CLI can use `FileTokenStore`.
//!
//! None of the operations return errors. A store that cannot persist logs the
//! failure and keeps serving the in-memory value.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::CredentialPair;

/// Durable storage for the current credential pair.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn TokenStore>`.
pub trait TokenStore: Send + Sync {
    /// Current pair, or `None` if nothing is stored or it was cleared.
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>>;

    /// Replace the stored pair. Access and refresh tokens change together.
    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Remove both tokens. Idempotent.
    fn clear(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Process-local store. Credentials do not survive a restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    state: Mutex<Option<CredentialPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a pair.
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            state: Mutex::new(Some(pair)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<CredentialPair>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = Some(pair);
            debug!("stored credential pair in memory");
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.state.lock().await.take();
        })
    }
}
