//! Authenticated API client for the OpenKMS backend
//!
//! Attaches the stored bearer token to every outbound call, detects 401,
//! refreshes the credential pair exactly once no matter how many requests
//! noticed the expiry, and replays the original request once with the new
//! token.
//!
//! Session lifecycle:
//! 1. `AuthFacade::login()` stores a pair → `Authenticated`
//! 2. `ApiClient::send()` reads the access token fresh for each dispatch
//! 3. A 401 hands the captured request to `RefreshCoordinator`, which runs a
//!    single shared refresh → `Refreshing` → `Authenticated`
//! 4. A rejected refresh clears the store → `Unauthenticated`
//! 5. `AuthFacade::logout()` clears the store → `Unauthenticated`

pub mod error;
pub mod facade;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use facade::AuthFacade;
pub use pipeline::{ApiClient, ApiRequest, PendingRequest};
pub use refresh::RefreshCoordinator;
pub use state::{AuthEvent, AuthState, SessionConfig, SessionState};
