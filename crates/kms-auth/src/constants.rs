//! Credential authority endpoints and client defaults
//!
//! Paths are relative to the configured API base URL
//! (e.g. `http://localhost:8000/api/v1`).

/// Login with username and password
pub const LOGIN_PATH: &str = "/auth/login";

/// Self-service registration, logs the new user in
pub const REGISTER_PATH: &str = "/auth/register";

/// Exchange a refresh token for a new credential pair
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Change the password of the authenticated user
pub const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";

/// Profile of the authenticated user
pub const CURRENT_USER_PATH: &str = "/users/me";

/// The only token type the authority issues.
pub const BEARER: &str = "bearer";

/// Upper bound for a single refresh call.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 5;

/// Default per-request timeout for API calls.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
