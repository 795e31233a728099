//! REST API Server

use super::rest::{OperatorInfoResponse, RestRouter};
use crate::error::{Error, Result};
use crate::registry::VolumeClassRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the REST API on `addr` until `cancel` fires
pub async fn run_rest_server(
    addr: SocketAddr,
    registry: Arc<VolumeClassRegistry>,
    info: OperatorInfoResponse,
    cancel: CancellationToken,
) -> Result<()> {
    let app = RestRouter::new(registry, info).build();

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
