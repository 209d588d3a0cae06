use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::Value;
use std::sync::Arc;
use crate::error::{AppError, Result};
use crate::pipeline::{message::Message, MessageSender};
use super::hmac::HmacValidator;

pub struct WebhookState {
    pub validator: Option<HmacValidator>,
    pub pipeline_tx: MessageSender,
}

/// Accepts one JSON object or an array of objects.
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    if let Some(validator) = &state.validator {
        let signature = headers
            .get(validator.header_name())
            .and_then(|h| h.to_str().ok())
            .ok_or(AppError::MissingSignature)?;

        validator.validate(&body, signature)?;
    }

    let messages = match serde_json::from_slice::<Value>(&body)? {
        Value::Array(items) => items
            .into_iter()
            .map(into_message)
            .collect::<Result<Vec<_>>>()?,
        value => vec![into_message(value)?],
    };

    let count = messages.len();
    for message in messages {
        state.pipeline_tx
            .send(message)
            .await
            .map_err(|_| AppError::PipelineSend)?;
    }

    tracing::debug!("Accepted {} messages from webhook", count);

    Ok(StatusCode::ACCEPTED)
}

fn into_message(value: Value) -> Result<Message> {
    match value {
        Value::Object(_) => Ok(Message::from_value(value)),
        other => Err(AppError::InvalidMessage(format!(
            "expected a JSON object, got: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::secret::SecretSource;
    use crate::pipeline::create_message_channel;
    use crate::sources::webhook::{register_webhook_routes, WebhookAuthentication, WebhookSourceConfig};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use ::hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    type HmacSha256 = Hmac<Sha256>;

    fn generate_signature(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_config() -> WebhookSourceConfig {
        WebhookSourceConfig {
            webhook_path: "/ingest".to_string(),
            port: 0,
            authentication: Some(WebhookAuthentication {
                secret: SecretSource::Plain("test_secret".to_string()),
                header_name: "X-Hub-Signature".to_string(),
            }),
            channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_signed_batch_is_forwarded() {
        let (tx, mut rx) = create_message_channel(16);
        let app = register_webhook_routes(Router::new(), &signed_config(), tx).unwrap();

        let body = r#"[{"level":"info","n":1},{"level":"warn","n":2}]"#;
        let signature = generate_signature("test_secret", body.as_bytes());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("X-Hub-Signature", format!("sha256={}", signature))
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.fields["n"], 1);
        assert_eq!(second.fields["n"], 2);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_rejected() {
        let (tx, mut rx) = create_message_channel(16);
        let app = register_webhook_routes(Router::new(), &signed_config(), tx).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("X-Hub-Signature", "sha256=invalidsignature")
                    .body(Body::from(r#"{"level":"info"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scalar_payload_is_rejected() {
        let (tx, _rx) = create_message_channel(16);
        let mut config = signed_config();
        config.authentication = None;
        let app = register_webhook_routes(Router::new(), &config, tx).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .body(Body::from("42"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
