use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use crate::pipeline::processors::Processor;
use crate::pipeline::sinks::Sink;
use crate::sources::Source;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type SharedSource = Arc<tokio::sync::Mutex<Box<dyn Source>>>;

/// Runs one source through an ordered chain of processors into one sink.
///
/// `run` drives the stream on the caller's task until the source ends or
/// `close` is called from elsewhere. Closing is cooperative: the pending
/// `Source::next` is abandoned at its next suspension point and the source's
/// release hook runs exactly once, whichever side gets to it first. Input a
/// source already acknowledged (see `Source::stop_intake`) is delivered
/// before the release hook runs.
pub struct Pipeline {
    source: Mutex<Option<Box<dyn Source>>>,
    processors: Arc<Vec<Box<dyn Processor>>>,
    sink: Arc<dyn Sink>,
    parallelism: usize,
    cln_token: CancellationToken,
    started: AtomicBool,
}

/// PipelineBuilder takes the mandatory source and sink up front; processors are appended in order.
pub struct PipelineBuilder {
    source: Box<dyn Source>,
    sink: Arc<dyn Sink>,
    processors: Vec<Box<dyn Processor>>,
    parallelism: usize,
}

impl PipelineBuilder {
    pub fn new(source: Box<dyn Source>, sink: Arc<dyn Sink>) -> Self {
        Self {
            source,
            sink,
            processors: Vec::new(),
            parallelism: 1,
        }
    }

    pub fn processor(mut self, processor: Box<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn processors(mut self, processors: impl IntoIterator<Item = Box<dyn Processor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Number of workers pulling from the source concurrently. With more than
    /// one, the sink sees concurrent `accept` calls and only per-worker order
    /// is preserved.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.parallelism == 0 {
            return Err(AppError::Config("Pipeline parallelism must be at least 1".to_string()));
        }

        Ok(Pipeline {
            source: Mutex::new(Some(self.source)),
            processors: Arc::new(self.processors),
            sink: self.sink,
            parallelism: self.parallelism,
            cln_token: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

impl Pipeline {
    pub fn builder(source: Box<dyn Source>, sink: Arc<dyn Sink>) -> PipelineBuilder {
        PipelineBuilder::new(source, sink)
    }

    /// Pulls every message through the processors into the sink.
    ///
    /// Returns `Ok(())` when the source ends or the pipeline is closed. Errors
    /// from the source, a processor or the sink abort the run and are returned
    /// as-is; the pipeline does not retry. May be called at most once.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyStarted);
        }

        let Some(source) = self.take_source() else {
            info!("Pipeline closed before it was started");
            return Ok(());
        };
        let source: SharedSource = Arc::new(tokio::sync::Mutex::new(source));

        info!(
            "Pipeline started with {} processors and parallelism {}",
            self.processors.len(),
            self.parallelism
        );

        let result = if self.parallelism == 1 {
            let worker = Worker {
                id: 0,
                source: source.clone(),
                processors: self.processors.clone(),
                sink: self.sink.clone(),
                cln_token: self.cln_token.clone(),
            };
            worker.run().await.map(|count| {
                debug!("Worker 0 forwarded {} messages", count);
            })
        } else {
            self.run_parallel(&source).await
        };

        let result = match result {
            Ok(()) if self.cln_token.is_cancelled() => self.drain(&source).await,
            other => other,
        };

        source.lock().await.close().await;

        match &result {
            Ok(()) if self.cln_token.is_cancelled() => info!("Pipeline stopped"),
            Ok(()) => info!("Pipeline finished: source exhausted"),
            Err(e) => error!("Pipeline aborted: {}", e),
        }

        result
    }

    async fn run_parallel(&self, source: &SharedSource) -> Result<()> {
        // Stops the remaining workers when one of them fails without closing the pipeline.
        let workers_token = self.cln_token.child_token();
        let mut workers = JoinSet::new();

        for id in 0..self.parallelism {
            let worker = Worker {
                id,
                source: source.clone(),
                processors: self.processors.clone(),
                sink: self.sink.clone(),
                cln_token: workers_token.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined
                .map_err(|e| AppError::Task(e.to_string()))
                .and_then(|result| result);

            if let Err(e) = outcome {
                workers_token.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Delivers what a stopped source still holds, on one worker that ignores the stop signal.
    async fn drain(&self, source: &SharedSource) -> Result<()> {
        if !source.lock().await.stop_intake().await {
            return Ok(());
        }

        let worker = Worker {
            id: self.parallelism,
            source: source.clone(),
            processors: self.processors.clone(),
            sink: self.sink.clone(),
            cln_token: CancellationToken::new(),
        };
        let drained = worker.run().await?;
        if drained > 0 {
            info!("Delivered {} messages queued before the pipeline was closed", drained);
        }
        Ok(())
    }

    /// Signals `run` to stop; does not wait for it to return.
    ///
    /// If `run` has not taken the source yet, the source is released here.
    /// Safe to call any number of times, before, during or after `run`.
    pub async fn close(&self) {
        self.cln_token.cancel();

        if let Some(mut source) = self.take_source() {
            source.close().await;
            debug!("Released source of a pipeline that never ran");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cln_token.is_cancelled()
    }

    fn take_source(&self) -> Option<Box<dyn Source>> {
        self.source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

struct Worker {
    id: usize,
    source: SharedSource,
    processors: Arc<Vec<Box<dyn Processor>>>,
    sink: Arc<dyn Sink>,
    cln_token: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<usize> {
        let mut forwarded = 0usize;

        while let Some(message) = self.pull().await? {
            if let Some(message) = self.transform(message).await? {
                self.sink.accept(message).await?;
                forwarded += 1;
            }
        }

        debug!("Worker {} done after {} messages", self.id, forwarded);
        Ok(forwarded)
    }

    async fn pull(&self) -> Result<Option<Message>> {
        if self.cln_token.is_cancelled() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = self.cln_token.cancelled() => Ok(None),
            next = async { self.source.lock().await.next().await } => next,
        }
    }

    async fn transform(&self, mut message: Message) -> Result<Option<Message>> {
        for (idx, processor) in self.processors.iter().enumerate() {
            match processor.process(message).await? {
                Some(processed) => message = processed,
                None => {
                    debug!("Message filtered out by processor {}", idx);
                    return Ok(None);
                }
            }
        }

        Ok(Some(message))
    }
}
