//! Cost optimization operator
//!
//! Reconciles optimization policies against their target workloads. Several
//! replicas may run; only the leader lease holder acts.

use anyhow::{Context, Result};
use costopt_operator::{api, bootstrap::bootstrap, config::OperatorConfig};
use operator_lib::observability::StructuredLogger;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time allowed for in-flight applies to settle on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting costopt-operator");

    let config = OperatorConfig::load().context("Failed to load configuration")?;
    info!(instance = %config.instance_id, api_port = config.api_port, "Operator configured");

    let operator = bootstrap(&config).await?;
    let logger = StructuredLogger::new(&config.instance_id);
    logger.log_startup(OPERATOR_VERSION, operator.policies);

    // Start health, metrics and policy API
    let api_handle = tokio::spawn(api::serve(config.api_port, operator.app_state.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = operator.controller;
    let controller_handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    operator.health.set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    operator.health.set_ready(false).await;

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_GRACE, controller_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Controller stopped with an error"),
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => warn!("Controller did not stop within the grace period"),
    }
    api_handle.abort();

    logger.log_shutdown("SIGINT received");
    Ok(())
}
