//! Runs one or more worker agents against a remote orchestrator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dirsub_core::worker::WorkerAgent;
use dirsub_core::{OrchestratorConfig, WorkerId};
use dirsub_worker::{HttpAutomation, HttpOrchestratorClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "dirsub-worker")]
#[command(about = "Directory submission worker: leases jobs and drives them through automation")]
struct Cli {
    /// Orchestrator base URL
    #[arg(long, env = "DIRSUB_ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8080")]
    orchestrator_url: String,

    /// Automation service endpoint receiving one POST per attempt
    #[arg(long, env = "DIRSUB_AUTOMATION_URL")]
    automation_url: String,

    /// Number of agents to run in this process
    #[arg(short, long, env = "DIRSUB_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Prefix for generated worker ids
    #[arg(long, env = "DIRSUB_WORKER_PREFIX", default_value = "dirsub-worker")]
    worker_prefix: String,

    /// Per-request timeout for orchestrator calls, in seconds
    #[arg(long, env = "DIRSUB_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Orchestrator config file (TOML or JSON)
    #[arg(long, env = "DIRSUB_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = dotenvy::dotenv().map(|_| true).or_else(|err| match err {
        dotenvy::Error::Io(_) => Ok(false),
        _ => Err(err),
    })?;
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }

    let config = match cli.config.as_ref() {
        Some(path) => OrchestratorConfig::load_from_file(path),
        None => OrchestratorConfig::load_from_env(),
    }
    .context("failed to load orchestrator configuration")?;

    let orchestrator = HttpOrchestratorClient::new(
        cli.orchestrator_url.clone(),
        Duration::from_secs(cli.request_timeout_secs.max(1)),
    )
    .context("failed to build orchestrator client")?;
    let automation = HttpAutomation::new(cli.automation_url.clone(), config.worker.attempt_timeout())
        .context("failed to build automation client")?;

    let orchestrator = Arc::new(orchestrator);
    let automation = Arc::new(automation);
    let shutdown = CancellationToken::new();
    let run_id = Uuid::new_v4().simple().to_string();

    info!(
        orchestrator = %cli.orchestrator_url,
        automation = %cli.automation_url,
        workers = cli.workers,
        attempt_timeout_ms = config.worker.attempt_timeout_ms,
        max_attempts = config.retry.max_attempts,
        "starting worker agents"
    );

    let mut handles = Vec::with_capacity(cli.workers.max(1));
    for index in 0..cli.workers.max(1) {
        let id = WorkerId::new(format!("{}-{}-{}", cli.worker_prefix, &run_id[..8], index));
        let agent = WorkerAgent::new(
            id,
            orchestrator.clone(),
            automation.clone(),
            config.clone(),
        );
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { agent.run(shutdown).await }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; finishing current submissions");
    shutdown.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "worker agent task failed");
        }
    }

    info!("all worker agents stopped");
    Ok(())
}
