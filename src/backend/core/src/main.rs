//! SQLBatch Scheduler - Main entry point
//!
//! Runs the discover / claim / execute cycle against a shared Redis until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use clap::Parser;

use sqlbatch_core::{
    config::Config,
    jobs::{
        CancellationRegistry, JobStore, KeyValueStore, PgQueryExecutor, QueueSeeker, RedisStore,
        Scheduler, WorkInProgressIndex,
    },
    telemetry,
};

#[derive(Parser)]
#[command(
    name = "sqlbatch-scheduler",
    version,
    about = "Runs batch SQL jobs queued per tenant"
)]
struct Cli {
    /// Configuration file path; `SQLBATCH__*` variables override it
    #[arg(short, long, env = "SQLBATCH_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_logging(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_queued_jobs = config.batch.max_queued_jobs,
        concurrency = config.scheduler.concurrency,
        "Starting SQLBatch scheduler"
    );

    let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.redis.url).await?);
    tracing::info!("Connected to job store");

    let jobs = JobStore::new(store.clone(), config.batch.store_config());
    let seeker = QueueSeeker::new(store.clone(), config.batch.seeker_config());
    let wip = WorkInProgressIndex::new(store, seeker.clone());

    let scheduler = Scheduler::new(
        jobs,
        seeker,
        wip,
        Arc::new(PgQueryExecutor::new(config.executor.clone())),
        CancellationRegistry::new(),
        config.scheduler.clone(),
    );
    let handle = scheduler.start();

    shutdown_signal().await;

    handle.shutdown();
    let stats = handle.stats().clone();
    handle.join().await;

    tracing::info!(
        cycles = stats.cycles(),
        done = stats.done(),
        failed = stats.failed(),
        cancelled = stats.cancelled(),
        "Scheduler shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
