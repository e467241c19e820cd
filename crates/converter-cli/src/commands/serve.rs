//! Serve command implementation.

use crate::server::{start_server, ServerState};
use anyhow::{Context, Result};
use converter_core::{Config, JobScheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Upper bound for stopping jobs and flushing their windows on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the converter service until SIGINT or SIGTERM.
pub async fn run(config: Config, port: Option<u16>) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let port = port.unwrap_or(config.monitoring.http_port);

    let scheduler = Arc::new(JobScheduler::from_config(&config)?);
    info!(
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        sources = config.rawdata_sources.len(),
        jobs = config.jobs.len(),
        "Starting converter service"
    );

    if config.scheduler.schedule_predefined_jobs {
        let jobs = scheduler
            .schedule_predefined()
            .await
            .context("Failed to schedule predefined jobs")?;
        info!(jobs = jobs.len(), "Scheduled predefined jobs");
    }
    scheduler.health().set_ready(true);

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_state = Arc::new(ServerState {
        scheduler: Arc::clone(&scheduler),
    });
    let server = tokio::spawn(start_server(server_state, port, shutdown_tx.subscribe()));

    wait_for_signal().await?;

    scheduler.shutdown(SHUTDOWN_TIMEOUT).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server task failed");
    }

    info!("Converter service stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
