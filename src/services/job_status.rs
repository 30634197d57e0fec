use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::{JobProcessingConfig, TerminalPolicy};
use crate::models::job::{ImportStats, Job, JobStatus, JobType, JobUpdate, MergeError};
use crate::services::store::{JobStore, StoreError};

/// Outcome envelope of the convenience wrappers. They never return `Err`;
/// terminal failures land in `error`.
#[derive(Debug)]
pub struct JobUpdateResult {
    pub success: bool,
    pub job_id: String,
    pub job: Option<Job>,
    pub error: Option<JobError>,
}

/// Sole writer of job snapshots.
///
/// Every update reads the stored snapshot, merges the partial update onto it
/// and writes it back conditionally, so a concurrent writer causes a retry
/// instead of a lost update. Progress-bearing snapshots are then published on
/// the progress channel.
pub struct JobStatusService {
    store: Arc<dyn JobStore>,
    config: JobProcessingConfig,
}

impl JobStatusService {
    pub fn new(store: Arc<dyn JobStore>, config: JobProcessingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &JobProcessingConfig {
        &self.config
    }

    /// Point read of the current snapshot.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let raw = self.store.get(&self.config.job_key(job_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Apply `update` with the configured retry budget.
    ///
    /// Returns `Ok(None)` when the job does not exist; that is never an error
    /// and never creates the job.
    pub async fn update_status(
        &self,
        job_id: &str,
        update: &JobUpdate,
    ) -> Result<Option<Job>, JobError> {
        self.update_status_with_retries(job_id, update, self.config.max_retries)
            .await
    }

    /// Apply `update`, retrying transient failures up to `retries` more times
    /// with a fixed delay, then surfacing the last error.
    pub async fn update_status_with_retries(
        &self,
        job_id: &str,
        update: &JobUpdate,
        retries: u32,
    ) -> Result<Option<Job>, JobError> {
        if let Some(stats) = &update.stats {
            if !stats.is_finite() {
                return Err(JobError::InvalidProgress {
                    job_id: job_id.to_string(),
                });
            }
        }

        let mut retries_remaining = retries;
        loop {
            match self.apply_update(job_id, update).await {
                Ok(job) => return Ok(job),
                Err(e) if e.is_transient() && retries_remaining > 0 => {
                    warn!(
                        job_id = %job_id,
                        retries_remaining = retries_remaining,
                        error = %e,
                        "Retrying job status update"
                    );
                    metrics::counter!("job_status_update_retries_total").increment(1);
                    retries_remaining -= 1;
                    sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        retries = retries,
                        error = %e,
                        "Failed to update job status"
                    );
                    metrics::counter!("job_status_update_failures_total").increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn apply_update(&self, job_id: &str, update: &JobUpdate) -> Result<Option<Job>, JobError> {
        let key = self.config.job_key(job_id);

        let Some(raw) = self.store.get(&key).await? else {
            warn!(job_id = %job_id, "Job not found in store, skipping update");
            metrics::counter!("job_status_not_found_total").increment(1);
            return Ok(None);
        };
        let current: Job = serde_json::from_str(&raw)?;

        if self.config.terminal_policy == TerminalPolicy::Reject
            && !current.status.permits(update.status)
        {
            return Err(JobError::RejectedTransition {
                job_id: job_id.to_string(),
                from: current.status,
                requested: update.status,
            });
        }

        let mut merged = current.merge(update)?;
        merged.revision = current.revision + 1;
        let serialized = serde_json::to_string(&merged)?;

        let written = self
            .store
            .compare_and_set(&key, &raw, &serialized, self.config.job_ttl)
            .await?;
        if !written {
            return Err(JobError::Conflict {
                job_id: job_id.to_string(),
            });
        }
        metrics::counter!("job_status_updates_total").increment(1);
        debug!(
            job_id = %job_id,
            status = %merged.status,
            revision = merged.revision,
            "Job status updated"
        );

        if merged.broadcasts_progress() {
            self.broadcast(&merged).await;
        }

        Ok(Some(merged))
    }

    /// Best effort: the store already holds the snapshot, a lost publish is
    /// only logged.
    async fn broadcast(&self, job: &Job) {
        let payload = match serde_json::to_string(std::slice::from_ref(job)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failed to encode progress payload");
                return;
            }
        };

        match self
            .store
            .publish(&self.config.progress_channel, &payload)
            .await
        {
            Ok(()) => metrics::counter!("progress_broadcasts_total").increment(1),
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failed to publish job progress");
                metrics::counter!("progress_publish_failures_total").increment(1);
            }
        }
    }

    /// `status=processing`, `startTime=now`, `stats.progress=0`.
    pub async fn mark_job_processing(&self, job_id: &str) -> JobUpdateResult {
        let update = JobUpdate {
            status: Some(JobStatus::Processing),
            start_time: Some(now_ms()),
            stats: Some(ImportStats {
                progress: Some(0.0),
                ..Default::default()
            }),
            ..JobUpdate::for_type(JobType::ImportTransactions)
        };
        self.run("mark job as processing", job_id, update).await
    }

    /// Merges `stats.progress` (clamped to 0..=100) and `stats.processingTime` only.
    /// NaN or infinite values are refused with [`JobError::InvalidProgress`].
    pub async fn update_job_progress(
        &self,
        job_id: &str,
        progress: f64,
        processing_time: f64,
    ) -> JobUpdateResult {
        let update = JobUpdate {
            stats: Some(ImportStats {
                progress: Some(progress.clamp(0.0, 100.0)),
                processing_time: Some(processing_time),
                ..Default::default()
            }),
            ..JobUpdate::for_type(JobType::ImportTransactions)
        };
        self.run("update job progress", job_id, update).await
    }

    pub async fn mark_job_done(&self, job_id: &str, stats: ImportStats) -> JobUpdateResult {
        let update = JobUpdate {
            status: Some(JobStatus::Done),
            end_time: Some(now_ms()),
            stats: Some(stats),
            ..JobUpdate::for_type(JobType::ImportTransactions)
        };
        self.run("mark job as done", job_id, update).await
    }

    pub async fn mark_job_error(
        &self,
        job_id: &str,
        message: &str,
        stats: Option<ImportStats>,
    ) -> JobUpdateResult {
        let update = JobUpdate {
            status: Some(JobStatus::Error),
            end_time: Some(now_ms()),
            error: Some(message.to_string()),
            stats,
            ..JobUpdate::for_type(JobType::ImportTransactions)
        };
        self.run("mark job as error", job_id, update).await
    }

    /// Put a job back to `queued` so it can be retried from the top. Clears
    /// the previous run's start and end times.
    pub async fn reset_job(&self, job_id: &str) -> JobUpdateResult {
        let update = JobUpdate {
            status: Some(JobStatus::Queued),
            ..JobUpdate::for_type(JobType::ImportTransactions)
        };
        self.run("reset job", job_id, update).await
    }

    async fn run(&self, action: &'static str, job_id: &str, update: JobUpdate) -> JobUpdateResult {
        match self.update_status(job_id, &update).await {
            Ok(job) => JobUpdateResult {
                success: job.is_some(),
                job_id: job_id.to_string(),
                job,
                error: None,
            },
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to {action}");
                JobUpdateResult {
                    success: false,
                    job_id: job_id.to_string(),
                    job: None,
                    error: Some(e),
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Job {job_id} update carries a non-finite progress or processing time")]
    InvalidProgress { job_id: String },

    #[error("Job {job_id} was modified concurrently")]
    Conflict { job_id: String },

    #[error("Job {job_id} is {from}, update rejected")]
    RejectedTransition {
        job_id: String,
        from: JobStatus,
        requested: Option<JobStatus>,
    },
}

impl JobError {
    /// Store failures and lost write races are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(_) | JobError::Conflict { .. })
    }
}
