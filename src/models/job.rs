use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a tracked job.
///
/// Ordered `queued → processing → {done, error}`. `done` and `error` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Done | JobStatus::Error => 2,
        }
    }

    /// Whether a strict state machine lets an update carrying `next` apply to a
    /// job currently in `self`. A reset to `queued` is always allowed; nothing
    /// else leaves a terminal state or moves backwards.
    pub fn permits(self, next: Option<JobStatus>) -> bool {
        match next {
            Some(JobStatus::Queued) => true,
            _ if self.is_terminal() => false,
            Some(next) => next.rank() >= self.rank(),
            None => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminator carried in the `type` field of every snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobType {
    #[serde(rename = "import-transactions")]
    ImportTransactions,
    #[serde(rename = "plaid-sync")]
    PlaidSync,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::ImportTransactions => "import-transactions",
            JobType::PlaidSync => "plaid-sync",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters reported by an import. Every field is optional so a partial
/// record can be merged onto a stored one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ImportStats {
    /// Field-wise merge: fields set in `update` win, the rest are kept.
    pub fn merged(&self, update: &ImportStats) -> ImportStats {
        ImportStats {
            progress: update.progress.or(self.progress),
            processing_time: update.processing_time.or(self.processing_time),
            total: update.total.or(self.total),
            created: update.created.or(self.created),
            updated: update.updated.or(self.updated),
            skipped: update.skipped.or(self.skipped),
            merged: update.merged.or(self.merged),
            invalid: update.invalid.or(self.invalid),
            errors: update.errors.clone().or_else(|| self.errors.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ImportStats::default()
    }

    /// False when `progress` or `processingTime` is NaN or infinite. Such
    /// values serialize as `null` and would erase the stored field.
    pub fn is_finite(&self) -> bool {
        self.progress.map_or(true, f64::is_finite)
            && self.processing_time.map_or(true, f64::is_finite)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportTransactionsJob {
    /// Correlation key usable before the job id is known to a consumer.
    pub file_name: String,
    #[serde(default)]
    pub stats: ImportStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaidSyncJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

/// Per-kind payload, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum JobKind {
    #[serde(rename = "import-transactions")]
    ImportTransactions(ImportTransactionsJob),
    #[serde(rename = "plaid-sync")]
    PlaidSync(PlaidSyncJob),
}

impl JobKind {
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::ImportTransactions(_) => JobType::ImportTransactions,
            JobKind::PlaidSync(_) => JobType::PlaidSync,
        }
    }
}

/// Snapshot of a job as stored and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of writes applied so far; the optimistic-lock version.
    #[serde(default)]
    pub revision: u64,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl Job {
    /// Initial snapshot of an import, written when the job is enqueued.
    pub fn queued_import(
        job_id: impl Into<String>,
        file_name: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            start_time: None,
            end_time: None,
            error: None,
            revision: 0,
            kind: JobKind::ImportTransactions(ImportTransactionsJob {
                file_name: file_name.into(),
                stats: ImportStats::default(),
                user_id,
            }),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    pub fn file_name(&self) -> Option<&str> {
        match &self.kind {
            JobKind::ImportTransactions(import) => Some(&import.file_name),
            JobKind::PlaidSync(_) => None,
        }
    }

    pub fn stats(&self) -> Option<&ImportStats> {
        match &self.kind {
            JobKind::ImportTransactions(import) => Some(&import.stats),
            JobKind::PlaidSync(_) => None,
        }
    }

    /// Only progress-bearing snapshots are rebroadcast.
    pub fn broadcasts_progress(&self) -> bool {
        self.stats().and_then(|s| s.progress).is_some()
    }

    /// Apply a partial update. Plain fields are last-writer-wins; `stats` is
    /// merged field by field. The revision is left untouched.
    pub fn merge(&self, update: &JobUpdate) -> Result<Job, MergeError> {
        let stored = self.job_type();
        if let Some(requested) = update.job_type {
            if requested != stored {
                return Err(MergeError::KindMismatch { stored, requested });
            }
        }

        let mut merged = self.clone();
        if let Some(status) = update.status {
            merged.status = status;
        }
        if let Some(start_time) = update.start_time {
            merged.start_time = Some(start_time);
        }
        if let Some(end_time) = update.end_time {
            merged.end_time = Some(end_time);
        }
        if let Some(error) = &update.error {
            merged.error = Some(error.clone());
        }
        // `error` only describes a failed job
        if merged.status != JobStatus::Error {
            merged.error = None;
        }
        // A job put back in the queue has not started yet
        if update.status == Some(JobStatus::Queued) {
            merged.start_time = None;
            merged.end_time = None;
        }

        if let Some(stats) = &update.stats {
            match &mut merged.kind {
                JobKind::ImportTransactions(import) => import.stats = import.stats.merged(stats),
                JobKind::PlaidSync(_) => return Err(MergeError::StatsNotSupported(stored)),
            }
        }

        Ok(merged)
    }
}

/// Partial update; `None` means "leave as stored".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// Kind the caller expects the stored job to be.
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error: Option<String>,
    pub stats: Option<ImportStats>,
}

impl JobUpdate {
    pub fn for_type(job_type: JobType) -> Self {
        Self {
            job_type: Some(job_type),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("update for a {requested} job cannot apply to a stored {stored} job")]
    KindMismatch { stored: JobType, requested: JobType },

    #[error("{0} jobs do not carry stats")]
    StatsNotSupported(JobType),
}
