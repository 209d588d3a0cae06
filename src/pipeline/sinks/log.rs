use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::Sink;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Passthrough output that logs every message as a JSON line.
#[derive(Default)]
pub struct LogSink {
    closed: AtomicBool,
    counter: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Sink for LogSink {
    async fn accept(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::SinkClosed);
        }

        tracing::info!(
            id = %message.id,
            index = message.index.as_deref().unwrap_or("-"),
            "{}",
            message.to_value()
        );
        self.counter.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Log sink closed after {} messages", self.message_counter());
        }
    }
}
