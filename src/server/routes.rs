use axum::{Router, routing::get, http::StatusCode};
use tower_http::trace::TraceLayer;
use crate::error::Result;
use crate::pipeline::MessageSender;
use crate::sources::webhook::{self, WebhookSourceConfig};

async fn health_check() -> StatusCode {
    StatusCode::OK
}

pub fn create_router(config: &WebhookSourceConfig, pipeline_tx: MessageSender) -> Result<Router> {
    let router = Router::new()
        .route("/-/healthz", get(health_check))
        .route("/-/ready", get(health_check));

    let router = webhook::register_webhook_routes(router, config, pipeline_tx)?;

    Ok(router.layer(TraceLayer::new_for_http()))
}
