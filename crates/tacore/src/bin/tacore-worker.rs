//! tacore-worker — a DEALER-connected worker process that registers with
//! the broker's backend, heartbeats independently, and dispatches requests
//! to a [`MethodHandler`].
//!
//! This binary wires up [`DefaultMethodHandler`], a reference implementation
//! that returns deterministic placeholders for the trading methods — the
//! concrete scanner/executor/risk engines are an external collaborator's
//! concern and are wired in by constructing a [`TacoreWorker`] with a
//! different handler. `health.check` is answered by the worker itself
//! regardless of which handler is configured.
//!
//! # Usage
//!
//! ```bash
//! tacore-worker --worker-id worker-1
//! TACORE_WORKER_ID=worker-1 tacore-worker --config config/tacore.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use tacore_core::{Cache, DefaultMethodHandler, ServiceConfig, Store, TacoreWorker};

/// A DEALER-connected worker process for the TACoreService broker.
#[derive(Parser, Debug)]
#[command(name = "tacore-worker", version, about)]
struct Cli {
    /// Path to the service configuration file (shared with the broker).
    #[arg(long, default_value = "config/tacore.toml")]
    config: String,

    /// This worker's self-declared identity, sent at REGISTER.
    #[arg(long, env = "TACORE_WORKER_ID")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(&cli.config)?;
    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

    tracing::info!(worker_id = %worker_id, "starting tacore-worker");

    let store = Store::open(&config.store_path).await?;
    let cache = Arc::new(Cache::connect(&config).await);
    tracing::info!(cache_available = cache.is_available().await, "cache backend probed");
    let worker = Arc::new(TacoreWorker::new(
        worker_id.clone(),
        config.worker_backend_transport(),
        config.heartbeat_interval(),
        Arc::new(DefaultMethodHandler),
        store,
        cache,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!(worker_id = %worker_id, "shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;

    tracing::info!("tacore-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
