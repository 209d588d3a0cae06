pub mod handler;
pub mod hmac;

use axum::{routing::post, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::secret::SecretSource;
use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use crate::pipeline::{create_message_channel, MessageSender};
use crate::server;
use super::{ChannelSource, Source};
use handler::{handle_webhook, WebhookState};
use self::hmac::HmacValidator;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSourceConfig {
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    #[serde(default = "crate::config::AppConfig::get_port")]
    pub port: u16,

    /// Requests are accepted unsigned when absent.
    #[serde(default)]
    pub authentication: Option<WebhookAuthentication>,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthentication {
    pub secret: SecretSource,

    #[serde(default = "default_header_name")]
    pub header_name: String,
}

impl WebhookSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.webhook_path.starts_with('/') {
            return Err(AppError::Config(format!(
                "webhookPath must start with '/': {}",
                self.webhook_path
            )));
        }
        if self.channel_capacity == 0 {
            return Err(AppError::Config("channelCapacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_webhook_path() -> String {
    "/ingest".to_string()
}

fn default_header_name() -> String {
    "X-Hub-Signature".to_string()
}

fn default_channel_capacity() -> usize {
    1000
}

pub fn register_webhook_routes(
    router: Router,
    config: &WebhookSourceConfig,
    pipeline_tx: MessageSender,
) -> Result<Router> {
    let validator = match &config.authentication {
        Some(auth) => Some(HmacValidator::new(auth.secret.resolve()?, auth.header_name.clone())),
        None => {
            tracing::warn!("Webhook {} accepts unsigned requests", config.webhook_path);
            None
        }
    };

    let state = Arc::new(WebhookState {
        validator,
        pipeline_tx,
    });

    let router = router.route(
        &config.webhook_path,
        post(handle_webhook).with_state(state),
    );

    tracing::info!("Registered webhook at: {}", config.webhook_path);

    Ok(router)
}

/// HTTP ingestion endpoint exposed as a source.
///
/// Requests are queued on a bounded channel and answered 202 once queued.
/// When a running pipeline is closed, new requests get 503 and the queued
/// messages are still delivered before the source is released. Messages
/// queued for a pipeline that never ran are discarded with a warning.
/// Releasing the source stops the HTTP server.
pub struct WebhookSource {
    messages: ChannelSource,
    server: Option<JoinHandle<Result<()>>>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

impl WebhookSource {
    /// Binds the listener up front so address errors surface at construction.
    pub async fn bind(config: &WebhookSourceConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
        Self::from_listener(listener, config)
    }

    pub fn from_listener(listener: TcpListener, config: &WebhookSourceConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = create_message_channel(config.channel_capacity);
        let router = server::routes::create_router(config, tx)?;

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server::serve(listener, router, shutdown.clone()));

        Ok(Self {
            messages: ChannelSource::new(rx),
            server: Some(server),
            shutdown,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl Source for WebhookSource {
    async fn next(&mut self) -> Result<Option<Message>> {
        self.messages.next().await
    }

    async fn stop_intake(&mut self) -> bool {
        self.messages.stop_intake().await
    }

    async fn close(&mut self) {
        // Closing the queue first fails pending handlers instead of blocking the shutdown.
        self.messages.close().await;
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Webhook server stopped with error: {}", e),
                Err(e) => tracing::warn!("Webhook server task failed: {}", e),
            }
        }
    }
}
