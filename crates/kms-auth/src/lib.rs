//! OpenKMS credential authority client and token persistence
//!
//! Provides the unauthenticated calls to the credential authority (login,
//! registration, token refresh), the atomic access/refresh `CredentialPair`,
//! and the `TokenStore` capability that persists it. This crate knows nothing
//! about request replay or refresh coordination; those live in `kms-session`.
//!
//! Credential flow:
//! 1. `Authority::login()` or `Authority::register()` returns a `CredentialPair`
//! 2. The pair is written through a `TokenStore` (`FileTokenStore` on disk)
//! 3. On a 401 the session layer calls `Authority::refresh()` with the stored
//!    refresh token and writes the rotated pair back

pub mod constants;
pub mod credentials;
pub mod error;
pub mod store;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialPair, FileTokenStore};
pub use error::{Error, Result};
pub use store::{MemoryTokenStore, TokenStore};
pub use token::{Authority, NewUser, Profile, TokenResponse};
