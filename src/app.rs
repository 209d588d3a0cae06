use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::pipeline::processors::create_processors;
use crate::pipeline::sinks::create_sink;
use crate::pipeline::Pipeline;
use crate::sources::create_source;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the configured pipeline until its source ends or the process is interrupted.
///
/// The sink is closed (final flush included) on every path once the pipeline
/// has been built.
pub async fn run(config: AppConfig) -> Result<()> {
    let processors = create_processors(&config.processors)?;
    let sink = create_sink(&config.sink).await?;

    let source = match create_source(&config.source).await {
        Ok(source) => source,
        Err(e) => {
            sink.close().await;
            return Err(e);
        }
    };

    let pipeline = match Pipeline::builder(source, sink.clone())
        .processors(processors)
        .parallelism(config.parallelism)
        .build()
    {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            sink.close().await;
            return Err(e);
        }
    };

    let runner = pipeline.clone();
    let mut run_task = tokio::spawn(async move { runner.run().await });

    let finished = tokio::select! {
        joined = &mut run_task => Some(joined),
        _ = wait_for_shutdown(tokio::signal::ctrl_c()) => None,
    };

    let result = match finished {
        Some(joined) => flatten(joined),
        None => {
            info!("Shutdown requested, stopping pipeline");
            pipeline.close().await;

            let grace_period = config.shutdown_grace_period();
            match tokio::time::timeout(grace_period, &mut run_task).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    warn!("Pipeline did not stop within {:?}, abandoning it", grace_period);
                    run_task.abort();
                    Ok(())
                }
            }
        }
    };

    sink.close().await;
    result
}

/// Resolves when `signal` fires. A signal that cannot be listened for never
/// resolves, so the pipeline keeps running until its source ends.
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("Failed to listen for shutdown signal, running until the source ends: {}", e);
        std::future::pending::<()>().await;
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| AppError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_waits_for_signal() {
        let result = tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(async { Ok(()) })).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_does_not_stop_pipeline() {
        let failing = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")) };

        let result = tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(failing)).await;
        assert!(result.is_err());
    }
}
