//! tacore-launcher — development launcher that starts the broker, waits for
//! its monitoring API to come up, then spawns a configurable number of
//! worker processes with colored log prefixes (like docker-compose).
//!
//! This is dev tooling only: it carries no invariants of its own
//! and is not part of the service's runtime contract.
//!
//! # Usage
//!
//! ```bash
//! tacore-launcher
//! tacore-launcher --config config/tacore.toml --workers 3
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;

use tacore_core::ServiceConfig;

/// Orchestrates a local tacore-broker plus N tacore-worker processes.
#[derive(Parser, Debug)]
#[command(name = "tacore-launcher", version, about)]
struct Cli {
    /// Path to the service configuration file.
    #[arg(long, default_value = "config/tacore.toml")]
    config: String,

    /// Number of worker processes to spawn.
    #[arg(long, default_value_t = 2)]
    workers: u32,

    /// Timeout in seconds to wait for the broker's monitoring API.
    #[arg(long, default_value_t = 10)]
    health_timeout: u64,
}

const COLORS: &[&str] = &[
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
];
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

struct ManagedChild {
    name: String,
    child: Child,
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

    let max_name_len = (0..cli.workers)
        .map(|i| format!("worker-{i}").len())
        .max()
        .unwrap_or(0)
        .max("broker".len());

    let shutdown = Arc::new(Notify::new());
    let mut children: Vec<ManagedChild> = Vec::new();

    tracing::info!("starting tacore-broker");
    let broker_color = format!("{BOLD}\x1b[96m");
    let broker_child = spawn_process(
        "cargo",
        &["run", "--bin", "tacore-broker", "--package", "tacore-core", "--", "--config", &cli.config],
        "broker",
        &broker_color,
        max_name_len,
    )?;
    children.push(ManagedChild {
        name: "broker".to_string(),
        child: broker_child,
    });

    let health_endpoint = format!("{}:{}/health", config.http_host, config.http_port);
    tracing::info!(endpoint = %health_endpoint, "waiting for broker monitoring API");
    if !wait_for_health(&health_endpoint, Duration::from_secs(cli.health_timeout)).await {
        tracing::error!("broker health check timed out after {}s", cli.health_timeout);
        kill_all(&mut children).await;
        anyhow::bail!("broker failed to start within {}s", cli.health_timeout);
    }
    tracing::info!("broker is healthy");

    for i in 0..cli.workers {
        let worker_id = format!("worker-{i}");
        let color = COLORS[i as usize % COLORS.len()];
        tracing::info!(worker = %worker_id, "spawning worker");
        let child = spawn_process(
            "cargo",
            &[
                "run",
                "--bin",
                "tacore-worker",
                "--package",
                "tacore-core",
                "--",
                "--config",
                &cli.config,
                "--worker-id",
                &worker_id,
            ],
            &worker_id,
            color,
            max_name_len,
        )?;
        children.push(ManagedChild {
            name: worker_id,
            child,
        });
    }

    tracing::info!(total = children.len(), "all processes started — press Ctrl+C to stop");

    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_for_signal.notify_waiters();
    });

    let exit_code = tokio::select! {
        _ = shutdown.notified() => {
            tracing::info!("shutdown signal received — stopping all processes");
            kill_all(&mut children).await;
            0
        }
        result = wait_for_any_exit(&mut children) => {
            match result {
                Ok((name, code)) => {
                    tracing::error!(worker = %name, code = code, "process exited unexpectedly");
                    kill_all(&mut children).await;
                    code.unwrap_or(1)
                }
                Err(e) => {
                    tracing::error!(error = %e, "error waiting for child processes");
                    kill_all(&mut children).await;
                    1
                }
            }
        }
    };

    tracing::info!("tacore-launcher exited");
    std::process::exit(exit_code);
}

fn spawn_process(
    program: &str,
    args: &[&str],
    name: &str,
    color: &str,
    max_name_len: usize,
) -> anyhow::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let prefix = format!("{color}{:>width$}{RESET} │ ", name, width = max_name_len);
    if let Some(stdout) = child.stdout.take() {
        let prefix = prefix.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("{prefix}{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let prefix = format!("{color}{:>width$}{RESET} │ ", name, width = max_name_len);
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{prefix}{line}");
            }
        });
    }

    Ok(child)
}

async fn wait_for_any_exit(children: &mut Vec<ManagedChild>) -> anyhow::Result<(String, Option<i32>)> {
    loop {
        for managed in children.iter_mut() {
            if let Some(status) = managed.child.try_wait()? {
                return Ok((managed.name.clone(), status.code()));
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn kill_all(children: &mut Vec<ManagedChild>) {
    for managed in children.iter_mut() {
        if let Some(pid) = managed.child.id() {
            #[cfg(unix)]
            {
                let _ = std::process::Command::new("kill").args(["-TERM", &pid.to_string()]).output();
                tracing::info!(worker = %managed.name, pid = pid, "sent SIGTERM");
            }
            #[cfg(not(unix))]
            {
                let _ = managed.child.start_kill();
                tracing::info!(worker = %managed.name, pid = pid, "sent kill signal");
            }
        }
    }

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);

    loop {
        let all_exited = children.iter_mut().all(|m| m.child.try_wait().ok().flatten().is_some());
        if all_exited {
            tracing::info!("all processes exited gracefully");
            return;
        }
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("graceful shutdown timed out — force killing remaining processes");
                for managed in children.iter_mut() {
                    if managed.child.try_wait().ok().flatten().is_none() {
                        let _ = managed.child.kill().await;
                        tracing::warn!(worker = %managed.name, "force killed");
                    }
                }
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// Probe the broker's `/health` endpoint until it answers or times out.
async fn wait_for_health(endpoint: &str, timeout: Duration) -> bool {
    let start = tokio::time::Instant::now();
    let interval = Duration::from_millis(200);
    let url = format!("http://{endpoint}");

    while start.elapsed() < timeout {
        if let Ok(resp) = reqwest::get(&url).await {
            if resp.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(interval).await;
    }
    false
}

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
