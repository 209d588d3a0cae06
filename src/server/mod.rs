pub mod routes;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use crate::error::Result;

pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
