//! Batching sink that decouples `accept` calls from writes to a remote store.
//!
//! Messages are buffered and written as one bulk operation when either the
//! buffer reaches `batch_size` or the flush interval elapses, whichever comes
//! first.
//!
//! ```text
//!   accept ──push──▶ ┌────────┐  size reached ──┐
//!                    │ buffer │                 ├─ swap out ──▶ BulkWriter
//!   interval timer ─▶└────────┘  tick ──────────┘
//! ```
//!
//! The buffer is swapped for an empty one under its lock, so each batch is
//! owned by exactly one flush and concurrent `accept` calls land in the next
//! batch. Writes to the store are serialized.
//!
//! Delivery is at-most-once: the part of a batch the store still refuses after
//! the retries the [`FailurePolicy`] allows is counted and dropped. Nothing
//! replays it from the source.

use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::Sink;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote store accepting batches of messages.
#[async_trait::async_trait]
pub trait BulkWriter: Send + Sync {
    /// Stores the batch. A write that fails after keeping part of it returns
    /// [`AppError::PartialWrite`] with the ids of the kept messages, so a
    /// retry only resends the rest.
    async fn bulk_write(&self, batch: &[Message]) -> Result<()>;

    /// Releases the connection. Called once, after the final flush.
    async fn close(&self) -> Result<()>;
}

/// What happens to a batch the store refused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log, count and discard the batch.
    #[default]
    Drop,
    /// Retry up to `max_retries` more times, then drop.
    #[serde(rename_all = "camelCase")]
    Retry { max_retries: u32, backoff_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    SizeReached(usize),
    IntervalElapsed(Duration),
    Manual,
    Close,
}

#[derive(Debug, Clone)]
pub struct BulkSettings {
    flush_interval: Duration,
    batch_size: usize,
    flush_timeout: Duration,
    failure_policy: FailurePolicy,
}

impl BulkSettings {
    pub fn new(flush_interval: Duration, batch_size: usize) -> Result<Self> {
        if flush_interval.is_zero() {
            return Err(AppError::Config(format!(
                "Flush interval cannot be negative or zero: {:?}",
                flush_interval
            )));
        }
        if batch_size == 0 {
            return Err(AppError::Config("Batch size must be a positive integer".to_string()));
        }

        Ok(Self {
            flush_interval,
            batch_size,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            failure_policy: FailurePolicy::Drop,
        })
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Result<Self> {
        if flush_timeout.is_zero() {
            return Err(AppError::Config("Flush timeout cannot be zero".to_string()));
        }
        self.flush_timeout = flush_timeout;
        Ok(self)
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Counters for one consumer instance. They only ever grow.
#[derive(Debug, Default)]
struct DeliveryCounters {
    accepted: AtomicU64,
    flushed: AtomicU64,
    failed_flushes: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub accepted: u64,
    pub flushed: u64,
    pub failed_flushes: u64,
    pub dropped: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Open,
    Closing,
    Closed,
}

struct Buffer {
    state: ConsumerState,
    messages: Vec<Message>,
}

struct Shared {
    buffer: Mutex<Buffer>,
    writer: Arc<dyn BulkWriter>,
    settings: BulkSettings,
    counters: DeliveryCounters,
    write_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Marks a checked-out batch until its flush finishes.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Shared {
    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps the current batch out while the consumer is open. Must be called with the buffer locked.
    fn checkout(&self, buffer: &mut Buffer) -> Option<(Vec<Message>, InFlight<'_>)> {
        if buffer.state != ConsumerState::Open || buffer.messages.is_empty() {
            return None;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let batch = std::mem::replace(
            &mut buffer.messages,
            Vec::with_capacity(self.settings.batch_size),
        );
        Some((batch, InFlight(self)))
    }

    async fn flush_current(&self, trigger: FlushTrigger) {
        let checked_out = {
            let mut buffer = self.lock_buffer();
            self.checkout(&mut buffer)
        };

        if let Some((batch, _in_flight)) = checked_out {
            self.write_batch(batch, trigger).await;
        }
    }

    /// Writes `batch`, retrying per the failure policy. Messages the store
    /// reports as kept by a failed attempt count as flushed and are not sent again.
    async fn write_batch(&self, mut pending: Vec<Message>, trigger: FlushTrigger) {
        let size = pending.len();
        let _write_guard = self.write_lock.lock().await;

        let mut attempt: u32 = 0;
        let last_error = loop {
            attempt += 1;
            let result = match time::timeout(self.settings.flush_timeout, self.writer.bulk_write(&pending)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::FlushTimeout(self.settings.flush_timeout)),
            };

            let e = match result {
                Ok(()) => {
                    self.record_flushed(pending.len());
                    self.counters.batches.fetch_add(1, Ordering::Relaxed);
                    debug!("Flushed {} messages ({:?})", size, trigger);
                    return;
                }
                Err(AppError::PartialWrite { delivered, cause }) => {
                    let delivered: HashSet<String> = delivered.into_iter().collect();
                    let before = pending.len();
                    pending.retain(|message| !delivered.contains(&message.id));
                    self.record_flushed(before - pending.len());

                    if pending.is_empty() {
                        self.counters.batches.fetch_add(1, Ordering::Relaxed);
                        debug!("Flushed {} messages ({:?}) despite: {}", size, trigger, cause);
                        return;
                    }
                    AppError::Database(cause)
                }
                Err(e) => e,
            };

            match &self.settings.failure_policy {
                FailurePolicy::Retry { max_retries, backoff_ms } if attempt <= *max_retries => {
                    warn!(
                        "Bulk write failed with {} of {} messages outstanding (attempt {}/{}): {}",
                        pending.len(),
                        size,
                        attempt,
                        max_retries + 1,
                        e
                    );
                    time::sleep(Duration::from_millis(*backoff_ms)).await;
                }
                _ => break e,
            }
        };

        self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
        self.counters.dropped.fetch_add(pending.len() as u64, Ordering::Relaxed);
        error!(
            "Dropped {} of {} messages after {} attempts ({:?}): {}",
            pending.len(),
            size,
            attempt,
            trigger,
            last_error
        );
    }

    fn record_flushed(&self, count: usize) {
        self.counters.flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
        }
    }
}

/// Bulk delivery sink. Must be created inside a tokio runtime, which hosts the
/// interval timer.
pub struct BulkConsumer {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
    cln_token: CancellationToken,
}

impl BulkConsumer {
    pub fn new(writer: Arc<dyn BulkWriter>, settings: BulkSettings) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                state: ConsumerState::Open,
                messages: Vec::with_capacity(settings.batch_size),
            }),
            writer,
            settings,
            counters: DeliveryCounters::default(),
            write_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let cln_token = CancellationToken::new();
        let timer = tokio::spawn(run_timer(shared.clone(), cln_token.clone()));

        info!(
            "Created bulk consumer with batch size {} and flush interval {:?}",
            shared.settings.batch_size, shared.settings.flush_interval
        );

        Self {
            shared,
            timer: Mutex::new(Some(timer)),
            cln_token,
        }
    }

    /// Writes whatever is buffered right now.
    pub async fn flush(&self) {
        self.shared.flush_current(FlushTrigger::Manual).await;
    }

    /// Total messages accepted, flushed or not.
    pub fn message_counter(&self) -> u64 {
        self.shared.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> DeliveryStats {
        self.shared.stats()
    }

    pub fn buffered(&self) -> usize {
        self.shared.lock_buffer().messages.len()
    }

    fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

async fn run_timer(shared: Arc<Shared>, cln_token: CancellationToken) {
    let period = shared.settings.flush_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cln_token.cancelled() => break,
            _ = ticker.tick() => shared.flush_current(FlushTrigger::IntervalElapsed(period)).await,
        }
    }

    debug!("Bulk flush timer stopped");
}

#[async_trait::async_trait]
impl Sink for BulkConsumer {
    async fn accept(&self, message: Message) -> Result<()> {
        let full = {
            let mut buffer = self.shared.lock_buffer();
            if buffer.state != ConsumerState::Open {
                return Err(AppError::SinkClosed);
            }

            buffer.messages.push(message);
            self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);

            if buffer.messages.len() >= self.shared.settings.batch_size {
                self.shared.checkout(&mut buffer)
            } else {
                None
            }
        };

        if let Some((batch, _in_flight)) = full {
            let size = batch.len();
            self.shared.write_batch(batch, FlushTrigger::SizeReached(size)).await;
        }

        Ok(())
    }

    async fn close(&self) {
        let remaining = {
            let mut buffer = self.shared.lock_buffer();
            if buffer.state != ConsumerState::Open {
                return;
            }
            buffer.state = ConsumerState::Closing;
            std::mem::take(&mut buffer.messages)
        };

        self.cln_token.cancel();
        if let Some(timer) = self.take_timer() {
            if let Err(e) = timer.await {
                warn!("Bulk flush timer ended abnormally: {}", e);
            }
        }

        if !remaining.is_empty() {
            self.shared.write_batch(remaining, FlushTrigger::Close).await;
        }
        self.shared.wait_idle().await;

        if let Err(e) = self.shared.writer.close().await {
            warn!("Error when closing remote store connection: {}", e);
        }

        self.shared.lock_buffer().state = ConsumerState::Closed;

        let stats = self.shared.stats();
        info!(
            "Bulk consumer closed: accepted={} flushed={} failed_flushes={} dropped={}",
            stats.accepted, stats.flushed, stats.failed_flushes, stats.dropped
        );
    }
}

impl Drop for BulkConsumer {
    fn drop(&mut self) {
        self.cln_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<Vec<Message>>>,
        failures_left: AtomicU32,
        closes: AtomicU32,
    }

    impl RecordingWriter {
        fn failing(times: u32) -> Self {
            let writer = Self::default();
            writer.failures_left.store(times, Ordering::SeqCst);
            writer
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait::async_trait]
    impl BulkWriter for RecordingWriter {
        async fn bulk_write(&self, batch: &[Message]) -> Result<()> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Database("store unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(n: usize) -> Message {
        Message::from_value(json!({"n": n}))
    }

    fn settings(interval: Duration, batch_size: usize) -> BulkSettings {
        BulkSettings::new(interval, batch_size).unwrap()
    }

    #[test]
    fn test_settings_validation() {
        assert!(matches!(BulkSettings::new(Duration::ZERO, 10), Err(AppError::Config(_))));
        assert!(matches!(BulkSettings::new(Duration::from_secs(1), 0), Err(AppError::Config(_))));
        assert!(BulkSettings::new(Duration::from_secs(1), 1)
            .unwrap()
            .with_flush_timeout(Duration::ZERO)
            .is_err());
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_in_order() {
        let writer = Arc::new(RecordingWriter::default());
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_secs(3600), 2));

        for n in 1..=4 {
            consumer.accept(message(n)).await.unwrap();
        }

        assert_eq!(writer.batch_sizes(), vec![2, 2]);
        let batches = writer.batches.lock().unwrap().clone();
        assert_eq!(batches[0][0].fields["n"], 1);
        assert_eq!(batches[0][1].fields["n"], 2);
        assert_eq!(batches[1][0].fields["n"], 3);
        assert_eq!(batches[1][1].fields["n"], 4);

        let stats = consumer.counters();
        assert_eq!(stats.flushed, 4);
        assert_eq!(stats.failed_flushes, 0);
        assert_eq!(consumer.message_counter(), 4);
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let writer = Arc::new(RecordingWriter::default());
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_millis(50), 100));

        consumer.accept(message(1)).await.unwrap();
        assert!(writer.batch_sizes().is_empty());

        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(writer.batch_sizes(), vec![1]);
        assert_eq!(consumer.buffered(), 0);
        consumer.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_once_and_is_idempotent() {
        let writer = Arc::new(RecordingWriter::default());
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_secs(3600), 10));

        consumer.accept(message(1)).await.unwrap();
        consumer.accept(message(2)).await.unwrap();

        consumer.close().await;
        consumer.close().await;

        assert_eq!(writer.batch_sizes(), vec![2]);
        assert_eq!(writer.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(consumer.accept(message(3)).await, Err(AppError::SinkClosed)));
        assert_eq!(consumer.message_counter(), 2);
    }

    #[tokio::test]
    async fn test_close_with_empty_buffer_writes_nothing() {
        let writer = Arc::new(RecordingWriter::default());
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_secs(3600), 10));

        consumer.close().await;

        assert!(writer.batch_sizes().is_empty());
        assert_eq!(writer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_is_counted_and_dropped() {
        let writer = Arc::new(RecordingWriter::failing(1));
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_secs(3600), 2));

        for n in 1..=4 {
            consumer.accept(message(n)).await.unwrap();
        }

        assert_eq!(writer.batch_sizes(), vec![2]);
        let stats = consumer.counters();
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.flushed, 2);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_retry_policy_is_bounded() {
        let policy = FailurePolicy::Retry { max_retries: 2, backoff_ms: 1 };

        let writer = Arc::new(RecordingWriter::failing(2));
        let consumer = BulkConsumer::new(
            writer.clone(),
            settings(Duration::from_secs(3600), 1).with_failure_policy(policy.clone()),
        );
        consumer.accept(message(1)).await.unwrap();
        assert_eq!(writer.batch_sizes(), vec![1]);
        assert_eq!(consumer.counters().failed_flushes, 0);

        let writer = Arc::new(RecordingWriter::failing(10));
        let consumer = BulkConsumer::new(
            writer.clone(),
            settings(Duration::from_secs(3600), 1).with_failure_policy(policy),
        );
        consumer.accept(message(1)).await.unwrap();
        assert!(writer.batch_sizes().is_empty());
        assert_eq!(writer.failures_left.load(Ordering::SeqCst), 7);
        assert_eq!(consumer.counters().failed_flushes, 1);
    }

    /// Keeps the first half of the first batch it sees, then fails; later writes succeed.
    #[derive(Default)]
    struct HalfFailingWriter {
        stored: Mutex<Vec<Message>>,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl BulkWriter for HalfFailingWriter {
        async fn bulk_write(&self, batch: &[Message]) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                self.stored.lock().unwrap().extend_from_slice(batch);
                return Ok(());
            }

            let kept = &batch[..batch.len() / 2];
            self.stored.lock().unwrap().extend_from_slice(kept);
            Err(AppError::PartialWrite {
                delivered: kept.iter().map(|m| m.id.clone()).collect(),
                cause: "E11000 on the second collection".to_string(),
            })
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_resends_only_what_was_not_stored() {
        let writer = Arc::new(HalfFailingWriter::default());
        let consumer = BulkConsumer::new(
            writer.clone(),
            settings(Duration::from_secs(3600), 4)
                .with_failure_policy(FailurePolicy::Retry { max_retries: 1, backoff_ms: 1 }),
        );

        for n in 1..=4 {
            consumer.accept(message(n)).await.unwrap();
        }

        let stored: Vec<_> = writer.stored.lock().unwrap().iter().map(|m| m.fields["n"].clone()).collect();
        assert_eq!(stored, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(writer.attempts.load(Ordering::SeqCst), 2);

        let stats = consumer.counters();
        assert_eq!(stats.flushed, 4);
        assert_eq!(stats.failed_flushes, 0);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test]
    async fn test_partial_write_without_retry_drops_only_the_rest() {
        let writer = Arc::new(HalfFailingWriter::default());
        let consumer = BulkConsumer::new(writer.clone(), settings(Duration::from_secs(3600), 4));

        for n in 1..=4 {
            consumer.accept(message(n)).await.unwrap();
        }

        assert_eq!(writer.stored.lock().unwrap().len(), 2);
        let stats = consumer.counters();
        assert_eq!(stats.flushed, 2);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accept_loses_nothing() {
        let writer = Arc::new(RecordingWriter::default());
        let consumer = Arc::new(BulkConsumer::new(writer.clone(), settings(Duration::from_millis(5), 7)));

        let mut producers = Vec::new();
        for producer in 0..4 {
            let consumer = consumer.clone();
            producers.push(tokio::spawn(async move {
                for n in 0..250 {
                    consumer.accept(message(producer * 1000 + n)).await.unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        consumer.close().await;

        let mut seen: Vec<u64> = writer
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|m| m.fields["n"].as_u64().unwrap())
            .collect();
        assert_eq!(seen.len(), 1000);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
        assert_eq!(consumer.counters().flushed, 1000);
    }
}
