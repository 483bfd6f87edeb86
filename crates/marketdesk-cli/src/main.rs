//! marketdesk - command line front end for the marketplace admin backend.
//!
//! Signs operators in, keeps their credentials fresh, and sends arbitrary
//! requests to the backend through the authenticated pipeline.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketdesk_core::{AuthenticatedClient, Config, LoginRedirect, SessionStore};

/// Environment variable holding the password for non-interactive login
const ENV_PASSWORD: &str = "MARKETDESK_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "marketdesk", version, about = "Marketplace admin backend client")]
struct Cli {
    /// Override the backend base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the issued tokens
    Login {
        #[arg(long, env = "MARKETDESK_EMAIL")]
        email: Option<String>,
    },
    /// Forget stored tokens and the saved session
    Logout,
    /// Show credential and session state
    Status,
    /// Check the saved session and renew it if its lease ran out
    Session,
    /// GET a backend resource
    Get { path: String },
    /// POST a JSON body to a backend resource
    Post {
        path: String,
        /// JSON request body
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

/// Tells the operator to sign in again; there is no page to navigate to.
struct TerminalRedirect;

impl LoginRedirect for TerminalRedirect {
    fn redirect_to_login(&self, login_path: &str) {
        eprintln!(
            "Session expired. Sign in again with `marketdesk login` (login entry: {}).",
            login_path
        );
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_to_file.then(|| config.cache_dir()) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "marketdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let (mut config, load_error) = match Config::load() {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e)),
    };
    config.apply_env()?;
    if let Some(url) = cli.api_url.clone() {
        config.api_base_url = url;
    }

    let _log_guard = init_tracing(&config);
    if let Some(e) = load_error {
        warn!(error = %e, "Failed to load config, using defaults");
    }
    debug!(api = %config.api_base_url, storage = ?config.storage, "Config loaded");

    let client = AuthenticatedClient::from_config(&config)?.with_redirect(Arc::new(TerminalRedirect));

    match cli.command {
        Command::Login { email } => login(&mut config, &client, email).await,
        Command::Logout => logout(&config, &client),
        Command::Status => status(&config, &client),
        Command::Session => session(&config, &client).await,
        Command::Get { path } => send(&client, Method::GET, &path, None).await,
        Command::Post { path, data } => {
            let body: serde_json::Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            send(&client, Method::POST, &path, Some(body)).await
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

async fn login(config: &mut Config, client: &AuthenticatedClient, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Password: ")?,
    };

    if email.is_empty() || password.is_empty() {
        anyhow::bail!("Email and password required");
    }

    let outcome = client.manager().login(&email, &password).await?;

    let mut sessions = SessionStore::new(config.cache_dir()?);
    sessions.update(outcome.session());
    sessions.save()?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    let who = outcome.user.email.as_deref().unwrap_or(&outcome.user.id);
    println!("Logged in as {}", who);
    Ok(())
}

fn logout(config: &Config, client: &AuthenticatedClient) -> Result<()> {
    client.manager().logout();
    SessionStore::new(config.cache_dir()?).clear()?;
    println!("Logged out");
    Ok(())
}

fn status(config: &Config, client: &AuthenticatedClient) -> Result<()> {
    let store = client.manager().store();
    println!("API:          {}", config.api_base_url);
    println!("Storage:      {}", store.backend());
    println!(
        "Credentials:  {}",
        if store.has_tokens() { "present" } else { "none" }
    );

    let mut sessions = SessionStore::new(config.cache_dir()?);
    if !sessions.load()? {
        println!("Session:      none");
        return Ok(());
    }
    if let Some(ref data) = sessions.data {
        let state = match data.error {
            Some(kind) => format!("failed ({})", kind),
            None if data.is_expired() => "lease expired".to_string(),
            None => format!("{} min left", data.minutes_until_expiry()),
        };
        println!("Session:      {} [{}]", data.id, state);
    }
    Ok(())
}

async fn session(config: &Config, client: &AuthenticatedClient) -> Result<()> {
    let mut sessions = SessionStore::new(config.cache_dir()?);
    sessions.load()?;
    let current = sessions
        .data
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No saved session. Run `marketdesk login` first."))?;

    let looked_up = client.manager().session(&current).await;
    let failed = looked_up.error;
    let id = looked_up.id.clone();
    let minutes = looked_up.minutes_until_expiry();
    sessions.update(looked_up);
    sessions.save()?;

    if let Some(kind) = failed {
        TerminalRedirect.redirect_to_login(&config.login_path);
        anyhow::bail!("Session renewal failed ({})", kind);
    }

    info!(session_id = %id, "Session checked");
    println!("Session {} valid for {} more min", id, minutes);
    Ok(())
}

async fn send(
    client: &AuthenticatedClient,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> Result<()> {
    let mut envelope = client.request(method, path);
    if let Some(body) = body {
        envelope = envelope.json(&body)?;
    }

    let response = client.execute(envelope).await?;
    let status = response.status();
    let text = response.text().await.context("Failed to read response body")?;

    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }

    if !status.is_success() {
        anyhow::bail!("Request failed with status {}", status);
    }
    Ok(())
}
