//! # Pipegate - Main Entry Point
//!
//! Loads the gateway configuration, builds the per-API pipelines and
//! serves until SIGINT/SIGTERM. Configuration path comes from
//! `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`); listen address
//! from `GATEWAY_LISTEN_ADDR` (default `0.0.0.0:8080`).

use std::net::SocketAddr;

use tokio::signal;
use tracing::{error, info};

use pipegate::{Gateway, GatewayError, GatewayResult};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    init_tracing();

    info!("🚀 Starting pipegate v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let listen_addr: SocketAddr = std::env::var("GATEWAY_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .map_err(|e| GatewayError::config(format!("invalid listen address: {e}")))?;

    let gateway = Gateway::with_defaults()?;
    gateway.configure_from_file(&config_path).await.map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load configuration");
        e
    })?;

    // Serve in the background so the main task can wait on signals
    let mut server = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.start(listen_addr).await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining in-flight requests");
            gateway.stop();
            match server.await {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "server task failed"),
            }
        }
        result = &mut server => {
            match result {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "server task failed"),
            }
        }
    }

    info!("✅ pipegate shutdown complete");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipegate=info,tower_http=info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
