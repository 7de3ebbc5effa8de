// Keyfed — HTTP Server
//
// Serves the trigger endpoints that an external cron (or an operator)
// calls. Every instance of the service can run this; the lease table keeps
// concurrent triggers from doing the same work twice.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::{KeyfedError, Result};
use crate::federation::Coordinator;
use crate::store::FederationStore;

pub use routes::router;

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve<S: FederationStore>(coordinator: Arc<Coordinator<S>>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Keyfed HTTP server listening");

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| KeyfedError::Other(format!("HTTP server error: {}", e)))?;

    tracing::info!("Keyfed HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
