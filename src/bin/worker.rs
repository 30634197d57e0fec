use import_progress::{
    config::AppConfig,
    services::{
        job_status::JobStatusService,
        processor::{ImportRunner, RowCountProcessor, RunOutcome},
        queue::{JobQueue, QueueError},
        store::RedisJobStore,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting import worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let processing = config.job_processing();
    let poll_interval = Duration::from_millis(config.polling_interval_ms);

    tracing::info!("Connecting to Redis");
    let store = Arc::new(
        RedisJobStore::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    let queue = JobQueue::new(&config.redis_url, store.clone(), processing.clone())
        .expect("Failed to initialize job queue");
    queue.health_check().await.expect("Job queue is unreachable");
    let status = Arc::new(JobStatusService::new(store, processing.clone()));
    let runner = ImportRunner::new(status);
    let processor = RowCountProcessor::new(processing.chunk_size);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested, stopping worker");
        signal.cancel();
    });

    tracing::info!("Worker ready, starting job processing loop");

    while !shutdown.is_cancelled() {
        let idle = match process_next_job(&queue, &runner, &processor, &shutdown).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
                false
            }
            Ok(false) => {
                match queue.queue_depth().await {
                    Ok(depth) => tracing::trace!(depth = depth, "No jobs available, sleeping"),
                    Err(e) => tracing::warn!(error = %e, "Could not read queue depth"),
                }
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    tracing::info!("Worker stopped");
}

/// Process the next import from the queue.
/// Returns Ok(true) if an import was processed or handed back, Ok(false) if
/// none was available.
async fn process_next_job(
    queue: &JobQueue,
    runner: &ImportRunner,
    processor: &RowCountProcessor,
    shutdown: &CancellationToken,
) -> Result<bool, QueueError> {
    let Some(job) = queue.dequeue().await? else {
        return Ok(false);
    };

    tracing::info!(
        job_id = %job.job_id,
        file_name = %job.file_name,
        "Processing import job"
    );

    match runner.run_or_reset(&job, processor, shutdown).await {
        RunOutcome::Finished(result) => {
            if !result.success {
                // The store is authoritative; a job that could not be finalised expires via TTL
                tracing::warn!(
                    job_id = %job.job_id,
                    error = ?result.error,
                    "Final job status was not recorded"
                );
            }
            queue.complete(&job).await?;
        }
        RunOutcome::Interrupted(reset) => {
            if !reset.success {
                tracing::warn!(job_id = %job.job_id, error = ?reset.error, "Interrupted job was not reset");
            }
            queue.requeue(&job).await?;
            tracing::info!(job_id = %job.job_id, "Interrupted job returned to the queue");
        }
    }
    Ok(true)
}
