//! Mercado Livre token broker
//!
//! Single-binary service that:
//! 1. Starts authorization flows (state + PKCE) for sellers
//! 2. Consumes OAuth callbacks and persists token bundles in MySQL
//! 3. Serves ready-to-use access tokens to internal consumers, refreshing
//!    under a per-seller row lock

mod broker;
mod config;
mod error;
mod http;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meli_auth::MeliClient;
use meli_store::{MySqlStore, StateStore};
use sqlx::mysql::MySqlPoolOptions;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::{Broker, BrokerSettings};
use crate::config::Config;
use crate::http::{AppState, build_router};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-broker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.broker.listen_addr,
        auth_url = %config.broker.auth_url,
        api_base = %config.broker.api_base,
        state_ttl_secs = config.broker.state_ttl_secs,
        token_skew_secs = config.broker.token_skew_secs,
        "configuration loaded"
    );

    // Required settings were validated by Config::load
    let database_url = config.database.url.clone().context("database.url missing")?;
    let internal_key = config.internal_key.context("internal_key missing")?;
    let client_id = config.client_id.context("client_id missing")?;
    let client_secret = config.client_secret.context("client_secret missing")?;

    let pool = MySqlPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to MySQL")?;
    let store = MySqlStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to ensure broker schema")?;

    let client = MeliClient::with_base(&config.broker.api_base)
        .context("failed to build marketplace client")?;
    let settings = BrokerSettings {
        client_id,
        client_secret,
        redirect_uri: config.broker.redirect_uri.clone(),
        scope: config.broker.scope.clone(),
        auth_url: config.broker.auth_url.clone(),
        state_ttl_secs: config.broker.state_ttl_secs,
        token_skew_secs: config.broker.token_skew_secs,
    };
    let broker = Arc::new(Broker::new(store.clone(), client, settings));

    spawn_cleanup_task(
        store,
        config.broker.cleanup_interval_secs,
        config.broker.state_retention_days,
    );

    let state = AppState {
        broker,
        internal_key: Arc::new(internal_key),
        prometheus: prometheus_handle,
    };
    let app = build_router(state, config.broker.max_connections);

    let listener = TcpListener::bind(config.broker.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.broker.listen_addr))?;
    info!(addr = %config.broker.listen_addr, "listening");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, then drain
    // in-flight requests with a hard timeout starting at signal receipt.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => error!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Periodically delete authorization states that were consumed or lapsed
/// longer than the retention window ago.
fn spawn_cleanup_task(store: MySqlStore, interval_secs: u64, retention_days: i64) {
    let retention_secs = retention_days * 86_400;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // the first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.cleanup_states(retention_secs).await {
                Ok(removed) => {
                    metrics::record_cleanup(removed);
                    if removed > 0 {
                        info!(removed, "expired authorization states removed");
                    }
                }
                Err(e) => error!(error = %e, "state cleanup failed"),
            }
        }
    });
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
