//! Signal handling for graceful shutdown.

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Resolve when a shutdown signal (SIGTERM or SIGINT) arrives.
///
/// # Errors
/// Returns an error if the SIGTERM handler cannot be installed.
pub async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
    }
    Ok(())
}
