pub mod lines;
pub mod webhook;

use crate::error::Result;
use crate::pipeline::message::Message;
use crate::pipeline::MessageReceiver;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use lines::LinesSource;
pub use webhook::{WebhookSource, WebhookSourceConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Stdin,
    File { path: String },
    Webhook(WebhookSourceConfig),
}

/// Producer of the inbound message sequence, finite or infinite.
///
/// `next` is raced against the pipeline's stop signal and dropped when the
/// pipeline closes, so implementations must be cancel safe: a dropped `next`
/// future must not lose a message it has already taken from upstream.
#[async_trait::async_trait]
pub trait Source: Send {
    /// Next message, or `None` once the sequence has ended.
    async fn next(&mut self) -> Result<Option<Message>>;

    /// Called once when the pipeline is closed while running. A source that
    /// holds input it already acknowledged upstream stops taking more and
    /// returns `true`; the pipeline then pulls `next` until `None` before the
    /// release hook runs. The remainder must be finite.
    async fn stop_intake(&mut self) -> bool {
        false
    }

    /// Release hook. The pipeline calls it exactly once, after the last `next`.
    async fn close(&mut self) {}
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Adapts any iterator, including infinite ones.
pub struct IterSource<I> {
    iter: I,
    on_close: Option<CloseHook>,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Message> + Send,
{
    pub fn new(iter: I) -> Self {
        Self { iter, on_close: None }
    }

    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

#[async_trait::async_trait]
impl<I> Source for IterSource<I>
where
    I: Iterator<Item = Message> + Send,
{
    async fn next(&mut self) -> Result<Option<Message>> {
        // An iterator never suspends; give the stop signal a chance to run.
        tokio::task::yield_now().await;
        Ok(self.iter.next())
    }

    async fn close(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Drains a message channel until every sender is dropped.
pub struct ChannelSource {
    receiver: MessageReceiver,
}

impl ChannelSource {
    pub fn new(receiver: MessageReceiver) -> Self {
        Self { receiver }
    }
}

#[async_trait::async_trait]
impl Source for ChannelSource {
    async fn next(&mut self) -> Result<Option<Message>> {
        Ok(self.receiver.recv().await)
    }

    async fn stop_intake(&mut self) -> bool {
        // Senders fail from here on; queued messages stay readable.
        self.receiver.close();
        true
    }

    async fn close(&mut self) {
        self.receiver.close();
        let mut discarded = 0usize;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("Discarded {} queued messages on source close", discarded);
        }
    }
}

pub async fn create_source(config: &SourceConfig) -> Result<Box<dyn Source>> {
    match config {
        SourceConfig::Stdin => Ok(Box::new(LinesSource::stdin())),
        SourceConfig::File { path } => Ok(Box::new(LinesSource::open(path).await?)),
        SourceConfig::Webhook(webhook_config) => Ok(Box::new(WebhookSource::bind(webhook_config).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::create_message_channel;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_iter_source_ends_and_runs_hook() {
        let closed = Arc::new(AtomicUsize::new(0));
        let hook_counter = closed.clone();
        let mut source = IterSource::new(vec![Message::from_value(json!({"n": 1}))].into_iter())
            .on_close(move || {
                hook_counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(source.next().await.unwrap().is_some());
        assert!(source.next().await.unwrap().is_none());

        source.close().await;
        source.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, rx) = create_message_channel(4);
        let mut source = ChannelSource::new(rx);

        tx.send(Message::from_value(json!({"n": 1}))).await.unwrap();
        drop(tx);

        assert!(source.next().await.unwrap().is_some());
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_source_stop_intake_keeps_queued_messages() {
        let (tx, rx) = create_message_channel(4);
        let mut source = ChannelSource::new(rx);

        tx.send(Message::from_value(json!({"n": 1}))).await.unwrap();
        tx.send(Message::from_value(json!({"n": 2}))).await.unwrap();

        assert!(source.stop_intake().await);
        assert!(tx.send(Message::from_value(json!({"n": 3}))).await.is_err());

        assert_eq!(source.next().await.unwrap().unwrap().fields["n"], 1);
        assert_eq!(source.next().await.unwrap().unwrap().fields["n"], 2);
        assert!(source.next().await.unwrap().is_none());
    }

    #[test]
    fn test_source_config_parsing() {
        let config: SourceConfig =
            serde_json::from_value(json!({"type": "file", "path": "/var/log/app.log"})).unwrap();
        assert!(matches!(config, SourceConfig::File { ref path } if path == "/var/log/app.log"));

        let config: SourceConfig = serde_json::from_value(json!({"type": "stdin"})).unwrap();
        assert!(matches!(config, SourceConfig::Stdin));
    }
}
