mod config;
mod credentials;
mod deploy;
mod forge;
mod git;
mod health;
mod http;
mod metrics;
mod registry;
mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Secrets};
use crate::credentials::{CredentialStore, PendingLogins};
use crate::deploy::{DeployExecutor, ProcessRunner};
use crate::forge::{GitHubProvider, ProviderApi};
use crate::metrics::MetricsRegistry;
use crate::registry::ScriptRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pushdeploy", about = "Push-to-deploy trigger for GitHub repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/pushdeploy/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub secrets: Arc<Secrets>,
    pub metrics: MetricsRegistry,
    pub credentials: CredentialStore,
    pub registry: ScriptRegistry,
    pub executor: DeployExecutor,
    /// Provider API backend.
    pub provider: Arc<dyn ProviderApi>,
    /// OAuth `state` values awaiting their callback.
    pub pending_logins: PendingLogins,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let secrets = Secrets::from_env(&config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        webhook_signatures = secrets.webhook_secret.is_some(),
        "starting pushdeploy"
    );

    // ---- Scripts root ----
    tokio::fs::create_dir_all(&config.storage.scripts_root)
        .await
        .with_context(|| {
            format!(
                "failed to create scripts root: {}",
                config.storage.scripts_root.display()
            )
        })?;

    match git::git_version().await {
        Ok(version) => tracing::info!(%version, "git available"),
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "git not usable; deployments will fail"),
    }

    // ---- Infrastructure clients ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("pushdeploy/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Provider backend ----
    let provider: Arc<dyn ProviderApi> = Arc::new(GitHubProvider::new(
        http_client,
        &config.provider,
        secrets.client_secret.clone(),
        config.oauth_callback_url(),
        metrics.clone(),
    )?);
    tracing::info!(api_url = %config.provider.api_url, "provider backend initialised");

    // ---- Deployment ----
    let registry = ScriptRegistry::new(&config.storage.scripts_root);
    let runner = Arc::new(ProcessRunner::new(
        config.provider.git_url.clone(),
        config.deploy.shell.clone(),
    ));
    let executor = DeployExecutor::new(registry.clone(), runner, metrics.clone());

    // ---- App state ----
    let state = AppState {
        credentials: CredentialStore::new(&config.storage.token_path),
        config: Arc::clone(&config),
        secrets: Arc::new(secrets),
        metrics,
        registry,
        executor,
        provider,
        pending_logins: PendingLogins::new(),
    };

    run_http_server(Arc::new(state)).await?;

    tracing::info!("pushdeploy shut down cleanly");
    Ok(())
}
