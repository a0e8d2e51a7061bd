//! collab-relay binary entry point.
//!
//! Usage:
//! ```bash
//! collab-relay --config relay.toml
//! collab-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use collab_sync_relay::broker::{Broker, MemoryBroker, RedisBroker};
use collab_sync_relay::config::Config;
use collab_sync_relay::http::{build_router, health};
use collab_sync_relay::identity::{IdentityProvider, JwtIdentityProvider, StaticIdentityProvider};
use collab_sync_relay::storage::{MemorySessionStore, SessionStore, SqliteSessionStore};
use collab_sync_relay::CollabRelay;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Real-time collaborative session relay.
#[derive(Parser, Debug)]
#[command(name = "collab-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: relay.toml if present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the bind address from the configuration
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    health::init_start_time();

    let identity = build_identity(&config);
    let store = build_store(&config).await?;
    let broker = build_broker(&config).await?;

    let bind_address = config.server.bind_address.clone();
    let relay = Arc::new(CollabRelay::new(config, identity, store, broker));
    let snapshot_task = relay.spawn_snapshot_task();

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(
        "collab-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        bind_address
    );

    axum::serve(listener, build_router(relay.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if let Some(task) = snapshot_task {
        task.abort();
    }
    relay.shutdown().await;
    tracing::info!("collab-relay stopped");
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(&path).context("Failed to load configuration"),
        None => {
            let default = PathBuf::from("relay.toml");
            if default.exists() {
                Config::from_file(&default).context("Failed to load relay.toml")
            } else {
                tracing::info!("No relay.toml found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

fn build_identity(config: &Config) -> Arc<dyn IdentityProvider> {
    match &config.auth.jwt_secret {
        Some(secret) => {
            tracing::info!("Authenticating with HS256 JWTs");
            Arc::new(JwtIdentityProvider::new(secret.as_bytes()))
        }
        None => {
            let provider = StaticIdentityProvider::new(config.auth.tokens.clone());
            if provider.is_empty() {
                tracing::warn!("No jwt_secret and no static tokens configured: every connection will be refused");
            } else {
                tracing::info!("Authenticating with {} static tokens", provider.len());
            }
            Arc::new(provider)
        }
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    if config.store.in_memory {
        tracing::info!("Session content kept in memory only");
        return Ok(Arc::new(MemorySessionStore::new()));
    }

    let store = SqliteSessionStore::new(&config.store.database)
        .await
        .with_context(|| format!("Failed to open {}", config.store.database.display()))?;
    match store.session_count().await {
        Ok(count) => tracing::info!(
            "Session store: {} ({} stored sessions)",
            config.store.database.display(),
            count
        ),
        Err(e) => tracing::warn!("Session store opened but could not be counted: {}", e),
    }
    Ok(Arc::new(store))
}

async fn build_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    match &config.broker.url {
        Some(url) => {
            let broker = RedisBroker::connect(url)
                .await
                .context("Failed to connect to the Redis broker")?;
            Ok(Arc::new(broker))
        }
        None => {
            tracing::info!("In-process broker: sessions are not shared with other relays");
            Ok(Arc::new(MemoryBroker::new(config.broker.channel_capacity)))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
