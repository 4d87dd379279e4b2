//! Standalone membrane server.
//!
//! Opens the core from environment configuration, binds the HTTP edge
//! and the sync accept loop, and runs until SIGINT. Exits 0 on clean
//! shutdown, non-zero when initialization fails (unreachable warm tier,
//! unbindable port, invalid configuration).

use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use membrane::api::{http, QueryApi};
use membrane::{Config, MemoryCore};

/// Grace window for background tasks after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "membrane=info,membrane_server=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Runtime initialization failed");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let edge_addr = format!("{}:{}", config.edge_host, config.edge_port);
    let sync_addr = format!("{}:{}", config.edge_host, config.sync_port);

    let core = match MemoryCore::open(config) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "Core initialization failed");
            return ExitCode::from(1);
        }
    };

    let edge_listener = match TcpListener::bind(&edge_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %edge_addr, error = %e, "Cannot bind edge port");
            return ExitCode::from(1);
        }
    };
    let sync_listener = match TcpListener::bind(&sync_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %sync_addr, error = %e, "Cannot bind sync port");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    core.start(cancel.clone());
    core.serve_sync(sync_listener, cancel.clone());

    let api = QueryApi::new(core);
    let edge = tokio::spawn(http::serve(api, edge_listener, cancel.clone()));

    info!(edge = %edge_addr, sync = %sync_addr, "Membrane serving");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handler failed");
    }
    info!("Shutdown signal received");

    // Give sweepers and senders their grace window; the outbound queues
    // are already durable in the warm store
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, edge).await;

    info!("Membrane stopped");
    ExitCode::SUCCESS
}
