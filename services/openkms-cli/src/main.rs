//! OpenKMS command-line client
//!
//! Thin shell around `kms_session::AuthFacade`:
//! 1. Loads `openkms.toml` (or `--config` / `OPENKMS_CONFIG`)
//! 2. Opens the token file named by `store.path`
//! 3. Runs one subcommand; protected calls refresh transparently on 401

mod config;


use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kms_auth::{FileTokenStore, NewUser};
use kms_session::{ApiRequest, AuthFacade};
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Env var consulted before prompting for a password
const PASSWORD_ENV: &str = "OPENKMS_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "openkms", version, about = "OpenKMS API client")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and store the token pair
    Login {
        #[arg(long, short)]
        username: String,
    },
    /// Create an account and log in as it
    Register {
        #[arg(long, short)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        office_location: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// Forget the stored tokens
    Logout,
    /// Show whether tokens are stored
    Status,
    /// Print the logged-in user's profile
    Whoami,
    /// Change the password (prompts for current and new)
    ChangePassword,
    /// GET a path relative to the base URL and print the JSON body
    Get { path: String },
    /// Send an arbitrary request through the authenticated pipeline
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Serialize)]
struct StatusReport<'a> {
    authenticated: bool,
    state: &'a str,
    base_url: &'a str,
    token_file: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    // stdout carries command output; logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Password from `OPENKMS_PASSWORD`, falling back to an interactive prompt.
fn read_password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        debug!("using password from {PASSWORD_ENV}");
        return Ok(password);
    }
    rpassword::prompt_password(prompt).context("failed to read password")
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method: {method}"))
}

fn build_request(method: &str, path: &str, data: Option<&str>) -> Result<ApiRequest> {
    let request = ApiRequest::new(parse_method(method)?, path);
    match data {
        Some(raw) => {
            let body: serde_json::Value =
                serde_json::from_str(raw).context("--data must be valid JSON")?;
            Ok(request.json(&body)?)
        }
        None => Ok(request),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.authority.base_url,
        token_file = %config.store.path.display(),
        "config loaded"
    );

    let store = Arc::new(FileTokenStore::open(config.store.path.clone()).await);
    let auth = AuthFacade::new(config.session(), store).await;

    run(cli.command, &auth, &config).await
}

async fn run(command: Command, auth: &AuthFacade, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => {
            let password = read_password("Password: ")?;
            auth.login(&username, &password)
                .await
                .context("login failed")?;
            println!("Logged in as {username}");
        }
        Command::Register {
            username,
            email,
            full_name,
            office_location,
            department,
        } => {
            let password = read_password("Choose a password: ")?;
            let user = NewUser {
                username,
                email,
                full_name,
                password,
                office_location,
                department,
            };
            auth.register(&user).await.context("registration failed")?;
            println!("Registered and logged in as {}", user.username);
        }
        Command::Logout => {
            auth.logout().await;
            println!("Logged out");
        }
        Command::Status => {
            let state = auth.state();
            print_json(&StatusReport {
                authenticated: auth.is_authenticated().await,
                state: state.label(),
                base_url: &config.authority.base_url,
                token_file: config.store.path.display().to_string(),
            })?;
        }
        Command::Whoami => match auth.current_user().await {
            Some(profile) => print_json(&profile)?,
            None => bail!("not logged in (or the session could not be refreshed)"),
        },
        Command::ChangePassword => {
            let current = rpassword::prompt_password("Current password: ")
                .context("failed to read password")?;
            let new = rpassword::prompt_password("New password: ")
                .context("failed to read password")?;
            if !auth.change_password(&current, &new).await {
                bail!("password change failed");
            }
            println!("Password changed");
        }
        Command::Get { path } => {
            let body: serde_json::Value = auth
                .client()
                .get_json(&path)
                .await
                .with_context(|| format!("GET {path} failed"))?;
            print_json(&body)?;
        }
        Command::Request { method, path, data } => {
            let request = build_request(&method, &path, data.as_deref())?;
            let response = auth
                .client()
                .send(request)
                .await
                .with_context(|| format!("{method} {path} failed"))?;
            let status = response.status();
            let text = response.text().await.context("failed to read response body")?;
            eprintln!("HTTP {}", status.as_u16());
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(body) => print_json(&body)?,
                Err(_) if !text.is_empty() => println!("{text}"),
                Err(_) => {}
            }
            if !status.is_success() {
                bail!("request returned {status}");
            }
        }
    }
    Ok(())
}
