pub mod bulk;
pub mod database;
pub mod document;
pub mod log;

use crate::error::Result;
use crate::pipeline::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use bulk::{BulkConsumer, BulkSettings, BulkWriter, DeliveryStats, FailurePolicy};
pub use database::{MongoBulkWriter, MongoSinkConfig};
pub use log::LogSink;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Log,
    Mongo(MongoSinkConfig),
}

/// Terminal stage of a pipeline.
///
/// `accept` may be called concurrently when the pipeline runs with more than
/// one worker.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Hands a message to the sink. Fails only when the sink no longer accepts input.
    async fn accept(&self, message: Message) -> Result<()>;

    /// Releases the sink. Idempotent and infallible: errors are logged.
    async fn close(&self);
}

pub async fn create_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    match config {
        SinkConfig::Log => Ok(Arc::new(LogSink::new())),
        SinkConfig::Mongo(mongo_config) => {
            let settings = mongo_config.bulk_settings()?;
            let writer = MongoBulkWriter::connect(mongo_config).await?;

            Ok(Arc::new(BulkConsumer::new(Arc::new(writer), settings)))
        }
    }
}
