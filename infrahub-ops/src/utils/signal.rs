//! Operator interrupts.

use super::{OpsError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// Resolves on SIGINT or SIGTERM.
pub async fn interrupted() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Waits `window`, failing with [`OpsError::Aborted`] if `interrupt` fires first.
pub async fn abort_window<F>(window: Duration, interrupt: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    if window.is_zero() {
        return Ok(());
    }
    warn!(
        "Waiting {} to allow the operator to abort... CTRL+C to cancel.",
        humantime::format_duration(window)
    );
    tokio::select! {
        _ = tokio::time::sleep(window) => Ok(()),
        _ = interrupt => Err(OpsError::Aborted),
    }
}
