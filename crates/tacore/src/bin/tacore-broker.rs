//! tacore-broker — the ROUTER/ROUTER load-balancing broker and its HTTP
//! monitoring API, run as a single process.
//!
//! # Usage
//!
//! ```bash
//! tacore-broker
//! tacore-broker --config config/tacore.toml
//! TACORE_ZMQ_FRONTEND_PORT=6000 tacore-broker
//! ```

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use tacore_core::broker::spawn_health_monitor;
use tacore_core::metrics::spawn_flush_task;
use tacore_core::{Cache, LoadBalancer, MetricsCollector, MonitoringState, ServiceConfig, Store};

/// The TACoreService broker: dual-ROUTER load balancer plus monitoring API.
#[derive(Parser, Debug)]
#[command(name = "tacore-broker", version, about)]
struct Cli {
    /// Path to the service configuration file.
    #[arg(long, default_value = "config/tacore.toml")]
    config: String,
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
    tracing::info!(service_name = %config.service_name, ?config.zmq_frontend_port, ?config.zmq_backend_port, "starting tacore-broker");

    let store = Store::open(&config.store_path).await?;
    let metrics = MetricsCollector::new();
    let cache = Arc::new(Cache::connect(&config).await);
    tracing::info!(cache_available = cache.is_available().await, "cache backend probed");

    let frontend_transport = config.frontend_transport();
    let backend_transport = config.backend_transport();
    let broker = Arc::new(
        LoadBalancer::bind(
            &frontend_transport,
            &backend_transport,
            store.clone(),
            metrics.clone(),
            config.stale_threshold(),
        )
        .await?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_monitor = spawn_health_monitor(broker.clone(), config.heartbeat_interval(), shutdown_rx.clone());
    let flush_task = spawn_flush_task(
        metrics.clone(),
        store.clone(),
        std::time::Duration::from_secs(config.metrics_collection_interval_seconds),
        shutdown_rx.clone(),
    );

    let monitoring_state = MonitoringState {
        store: store.clone(),
        metrics: metrics.clone(),
        cache: cache.clone(),
        service_name: config.service_name.clone(),
        started_at: std::time::Instant::now(),
    };
    let http_app = tacore_core::http::router(monitoring_state);
    let http_addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = TcpListener::bind(&http_addr).await?;
    tracing::info!(addr = %http_addr, "monitoring API listening");
    let http_shutdown = shutdown_rx.clone();
    let http_server = tokio::spawn(async move {
        let mut shutdown = http_shutdown;
        let serve = axum::serve(listener, http_app);
        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "monitoring API server exited with error");
                }
            }
            _ = shutdown.changed() => {}
        }
    });

    let broker_for_signal = broker.clone();
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
        let _ = shutdown_tx_signal.send(true);
    });

    broker.run().await?;

    let _ = shutdown_tx.send(true);
    let _ = health_monitor.await;
    let _ = flush_task.await;
    let _ = http_server.await;

    tracing::info!("tacore-broker exited cleanly");
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
