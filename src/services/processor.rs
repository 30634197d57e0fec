//! Producer side of an import: drives one queued import through its
//! lifecycle and reports progress through the job status service.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::job::ImportStats;
use crate::services::job_status::{JobStatusService, JobUpdateResult};
use crate::services::queue::QueuedImport;

/// Only `mark_job_done` reports 100.
const MAX_IN_FLIGHT_PROGRESS: f64 = 99.0;

/// Business logic that turns CSV content into import counters.
#[async_trait]
pub trait ImportProcessor: Send + Sync {
    async fn process(
        &self,
        job: &QueuedImport,
        content: &str,
        progress: &ProgressReporter<'_>,
    ) -> Result<ImportStats, ProcessError>;
}

/// Handle given to a processor for intermediate progress updates.
pub struct ProgressReporter<'a> {
    status: &'a JobStatusService,
    job_id: &'a str,
    started: Instant,
}

impl ProgressReporter<'_> {
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Publish `progress` percent, capped below 100 until the job is done.
    /// Failures are logged, never fatal.
    pub async fn report(&self, progress: f64) {
        let result = self
            .status
            .update_job_progress(self.job_id, progress.min(MAX_IN_FLIGHT_PROGRESS), self.elapsed_ms())
            .await;
        if let Some(e) = result.error {
            warn!(job_id = %self.job_id, error = %e, "Progress update failed");
        }
    }
}

/// How a cancellable run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The job reached `done` or `error`; the envelope is that final update.
    Finished(JobUpdateResult),
    /// Shutdown interrupted the job; the envelope is the reset to `queued`.
    Interrupted(JobUpdateResult),
}

pub struct ImportRunner {
    status: Arc<JobStatusService>,
}

impl ImportRunner {
    pub fn new(status: Arc<JobStatusService>) -> Self {
        Self { status }
    }

    /// Run `job` unless `shutdown` fires first, in which case the in-flight
    /// job is reset to `queued` so another worker can pick it up.
    pub async fn run_or_reset(
        &self,
        job: &QueuedImport,
        processor: &dyn ImportProcessor,
        shutdown: &CancellationToken,
    ) -> RunOutcome {
        tokio::select! {
            result = self.run(job, processor) => RunOutcome::Finished(result),
            _ = shutdown.cancelled() => {
                warn!(job_id = %job.job_id, "Import interrupted by shutdown, resetting to queued");
                RunOutcome::Interrupted(self.status.reset_job(&job.job_id).await)
            }
        }
    }

    /// Run `job` to completion. The returned envelope is the final
    /// `done`/`error` transition.
    pub async fn run(&self, job: &QueuedImport, processor: &dyn ImportProcessor) -> JobUpdateResult {
        let started = Instant::now();
        info!(job_id = %job.job_id, file_name = %job.file_name, "Starting import job");

        let processing = self.status.mark_job_processing(&job.job_id).await;
        if !processing.success {
            warn!(job_id = %job.job_id, "Could not mark job as processing, continuing");
        }

        let reporter = ProgressReporter {
            status: &self.status,
            job_id: &job.job_id,
            started,
        };

        let outcome = match job.decode_content() {
            Ok(content) => processor.process(job, &content, &reporter).await,
            Err(e) => Err(ProcessError::Failed(e.to_string())),
        };

        match outcome {
            Ok(mut stats) => {
                stats.progress = Some(100.0);
                stats.processing_time = Some(reporter.elapsed_ms());
                info!(
                    job_id = %job.job_id,
                    total = stats.total.unwrap_or(0),
                    invalid = stats.invalid.unwrap_or(0),
                    processing_time_ms = stats.processing_time.unwrap_or(0.0),
                    "Import job completed"
                );
                self.status.mark_job_done(&job.job_id, stats).await
            }
            Err(e) => {
                let message = e.to_string();
                warn!(job_id = %job.job_id, error = %message, "Import job failed");
                let stats = ImportStats {
                    errors: Some(vec![message.clone()]),
                    processing_time: Some(reporter.elapsed_ms()),
                    ..Default::default()
                };
                self.status
                    .mark_job_error(&job.job_id, &message, Some(stats))
                    .await
            }
        }
    }
}

/// Dry-run processor: validates the CSV shape without importing anything.
///
/// Splits on commas without honouring quotes. Rows whose column count differs
/// from the header are `invalid`, blank rows are `skipped`.
pub struct RowCountProcessor {
    chunk_size: usize,
}

impl RowCountProcessor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl ImportProcessor for RowCountProcessor {
    async fn process(
        &self,
        _job: &QueuedImport,
        content: &str,
        progress: &ProgressReporter<'_>,
    ) -> Result<ImportStats, ProcessError> {
        let mut lines = content.lines();
        let header = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or(ProcessError::EmptyContent)?;
        let columns = header.split(',').count();

        let rows: Vec<&str> = lines.collect();
        let total = rows.len();
        let mut skipped = 0u64;
        let mut invalid = 0u64;

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            for row in chunk {
                if row.trim().is_empty() {
                    skipped += 1;
                } else if row.split(',').count() != columns {
                    invalid += 1;
                }
            }
            let seen = ((index + 1) * self.chunk_size).min(total);
            progress.report(seen as f64 * 100.0 / total as f64).await;
        }

        Ok(ImportStats {
            total: Some(total as u64),
            created: Some(0),
            updated: Some(0),
            merged: Some(0),
            skipped: Some(skipped),
            invalid: Some(invalid),
            errors: Some(Vec::new()),
            ..Default::default()
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Decoded CSV content is empty")]
    EmptyContent,

    #[error("{0}")]
    Failed(String),
}
