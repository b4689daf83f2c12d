//! Shutdown handling
//!
//! Waits for a termination signal and tears the hubs down in order:
//! clients first so nothing new arrives, then every serial connection.

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

use crate::hub::ClientHub;

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

/// Disconnect every client, then close every serial port
pub async fn drain(hub: &Arc<ClientHub>) {
    hub.shutdown().await;
    hub.serial().close_all().await;
    info!("All serial ports closed");
}
