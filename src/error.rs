use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed host syntax. Expected host:port, got {0}")]
    InvalidHost(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HMAC validation failed")]
    HmacValidation,

    #[error("Missing signature header")]
    MissingSignature,

    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to send message to pipeline")]
    PipelineSend,

    #[error("Pipeline has already been started")]
    AlreadyStarted,

    #[error("Sink is closed")]
    SinkClosed,

    #[error("Source error: {0}")]
    Source(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Database error: {0}")]
    Database(String),

    /// The store kept some messages of a batch before failing.
    #[error("Bulk write failed after storing {} messages: {cause}", .delivered.len())]
    PartialWrite { delivered: Vec<String>, cause: String },

    #[error("Flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::HmacValidation => (StatusCode::UNAUTHORIZED, "Invalid signature".to_string()),
            AppError::MissingSignature => (StatusCode::BAD_REQUEST, "Missing signature header".to_string()),
            AppError::InvalidSignatureFormat => (StatusCode::BAD_REQUEST, "Invalid signature format".to_string()),
            AppError::InvalidMessage(msg) => (StatusCode::BAD_REQUEST, format!("Invalid message: {}", msg)),
            AppError::JsonParse(e) => (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)),
            AppError::PipelineSend => (StatusCode::SERVICE_UNAVAILABLE, "Pipeline is not accepting messages".to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
