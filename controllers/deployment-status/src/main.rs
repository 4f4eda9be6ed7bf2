//! Deployment Status Controller
//!
//! Watches `apps/v1` Deployments in one namespace and reports every observed
//! change on stdout as `[ADD|UPDATE|DELETE] - namespace/name` followed by the
//! Deployment status.
//!
//! Exit codes:
//! - `0`: stopped by SIGINT/SIGTERM after draining
//! - `1`: invalid configuration, Kubernetes client failure, or fatal watch error
//! - `2`: the initial sync timed out or exhausted its list failure budget

mod config;
mod error;
mod reconciler;

use crate::config::Config;
use crate::error::AppError;
use crate::reconciler::StatusPrinter;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use reconcile_engine::{Controller, KubeSource};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure rustls crypto provider before any client is built
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        error!("Failed to install rustls crypto provider: {:?}", e);
        return ExitCode::from(1);
    }

    match run().await {
        Ok(()) => {
            info!("Deployment Status Controller exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Deployment Status Controller failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), AppError> {
    info!("Starting Deployment Status Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Workers: {}", config.workers);
    info!(
        "  Sync timeout: {}",
        config
            .sync_timeout
            .map_or_else(|| "none".to_string(), |limit| format!("{}s", limit.as_secs()))
    );

    let client = Client::try_default().await?;
    let api: Api<Deployment> = Api::namespaced(client, &config.namespace);

    let controller = Controller::<Deployment>::new(
        Arc::new(KubeSource::new(api)),
        Arc::new(StatusPrinter::new(std::io::stdout())),
        config.controller_config(),
    );

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(stop.clone()));

    controller.run(config.workers, stop).await?;
    Ok(())
}

/// Cancels `stop` on the first SIGINT or SIGTERM.
async fn shutdown_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C");
    }

    stop.cancel();
}
