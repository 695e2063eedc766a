//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens are never part of the config; they live in the token file named by
//! `store.path`.

use kms_auth::{DEFAULT_REFRESH_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS};
use kms_session::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var overriding `authority.base_url`
pub const BASE_URL_ENV: &str = "OPENKMS_BASE_URL";

/// Env var naming the config file
pub const CONFIG_PATH_ENV: &str = "OPENKMS_CONFIG";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub authority: AuthorityConfig,
    pub store: StoreConfig,
}

/// Credential authority / API settings
#[derive(Debug, Deserialize)]
pub struct AuthorityConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Token persistence settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_refresh_timeout() -> u64 {
    DEFAULT_REFRESH_TIMEOUT_SECS
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            let url = url.trim().to_owned();
            if url.is_empty() {
                return Err(common::Error::Env {
                    var: BASE_URL_ENV.into(),
                    message: "value is empty".into(),
                });
            }
            config.authority.base_url = url;
        }

        if !config.authority.base_url.starts_with("http://")
            && !config.authority.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.authority.base_url
            )));
        }

        if config.authority.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.authority.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or OPENKMS_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from("openkms.toml")
    }

    /// Library-level session settings.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.authority.base_url.clone(),
            request_timeout: Duration::from_secs(self.authority.request_timeout_secs),
            refresh_timeout: Duration::from_secs(self.authority.refresh_timeout_secs),
        }
    }
}
