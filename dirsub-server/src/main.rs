//! # Dirsub Server
//!
//! Serves the orchestrator over HTTP. Uses Postgres when a database URL is
//! configured and an in-memory store otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dirsub_core::{InMemoryJobStore, JobStore, MIGRATOR, PostgresJobStore};
use dirsub_server::config::{ServerConfig, load_env_file, load_orchestrator_config};
use dirsub_server::housekeeper::spawn_housekeeper;
use dirsub_server::{AppState, create_app};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "dirsub-server")]
#[command(about = "Directory submission orchestrator: job leases, worker protocol and progress feed")]
struct Cli {
    /// Server host
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Postgres connection string; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum pooled database connections
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Orchestrator config file (TOML or JSON)
    #[arg(long, env = "DIRSUB_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Alternate .env file
    #[arg(long, env = "DIRSUB_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Do not run the lease housekeeper in this process
    #[arg(long, env = "DIRSUB_NO_HOUSEKEEPER", default_value_t = false)]
    no_housekeeper: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env has to be in place before clap reads env fallbacks.
    let env_file = std::env::var_os("DIRSUB_ENV_FILE").map(PathBuf::from);
    let env_file_loaded = load_env_file(env_file.as_ref())?;
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }

    let orchestrator = load_orchestrator_config(cli.config.as_ref())
        .context("failed to load orchestrator configuration")?;
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        database_url: cli.database_url,
        max_connections: cli.max_connections,
        housekeeper: !cli.no_housekeeper,
        orchestrator,
    };

    info!(
        lease.ttl_secs = config.orchestrator.lease.lease_ttl_secs,
        lease.max_consecutive_expiries = config.orchestrator.lease.max_consecutive_expiries,
        retry.max_attempts = config.orchestrator.retry.max_attempts,
        feed.max_page_size = config.orchestrator.feed.max_page_size,
        "orchestrator configuration in effect"
    );

    run_server(config).await
}

async fn connect_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using the in-memory job store (state is lost on restart)");
        return Ok(Arc::new(InMemoryJobStore::new(&config.orchestrator)));
    };

    if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")) {
        anyhow::bail!("Invalid database URL: must start with postgres:// or postgresql://");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Successfully connected to PostgreSQL");

    let store = PostgresJobStore::new_with_config(pool, &config.orchestrator)
        .await
        .context("job store initialisation failed")?;
    Ok(Arc::new(store))
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let addr = config.socket_addr()?;
    let store = connect_store(&config).await?;
    let state = AppState::new(store, config.orchestrator.clone());

    let shutdown = CancellationToken::new();
    let housekeeper = config.housekeeper.then(|| {
        spawn_housekeeper(
            state.service.clone(),
            config.orchestrator.lease.housekeeper_interval(),
            shutdown.clone(),
        )
    });

    let router = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting Dirsub Server (HTTP) on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = housekeeper
        && let Err(err) = handle.await
    {
        warn!(error = %err, "housekeeper task failed");
    }

    info!("server stopped");
    Ok(())
}
