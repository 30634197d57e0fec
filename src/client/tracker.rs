use serde::Serialize;

use crate::models::job::{ImportStats, Job, JobStatus};

/// Client-side view of one imported file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub file_name: String,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub stats: Option<ImportStats>,
    pub error: Option<String>,
    pub revision: u64,
}

impl FileStatus {
    fn from_job(file_name: &str, job: &Job) -> Self {
        Self {
            file_name: file_name.to_string(),
            job_id: Some(job.job_id.clone()),
            status: job.status,
            stats: job.stats().cloned(),
            error: job.error.clone(),
            revision: job.revision,
        }
    }
}

/// Folds progress snapshots into per-file state keyed by `fileName`, since a
/// consumer may not know the producer-assigned job id yet.
#[derive(Debug, Default, Clone)]
pub struct ImportTracker {
    statuses: Vec<FileStatus>,
    active_job_ids: Vec<String>,
}

impl ImportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> &[FileStatus] {
        &self.statuses
    }

    /// Jobs started locally that have not been seen to resolve yet.
    pub fn active_job_ids(&self) -> &[String] {
        &self.active_job_ids
    }

    /// Start tracking a job the consumer enqueued itself.
    pub fn track(&mut self, job_id: &str, file_name: &str) {
        if !self.active_job_ids.iter().any(|id| id == job_id) {
            self.active_job_ids.push(job_id.to_string());
        }
        match self.statuses.iter_mut().find(|s| s.file_name == file_name) {
            Some(entry) => {
                if entry.job_id.as_deref() != Some(job_id) {
                    entry.job_id = Some(job_id.to_string());
                    entry.status = JobStatus::Queued;
                    entry.stats = None;
                    entry.error = None;
                    entry.revision = 0;
                }
            }
            None => self.statuses.push(FileStatus {
                file_name: file_name.to_string(),
                job_id: Some(job_id.to_string()),
                status: JobStatus::Queued,
                stats: None,
                error: None,
                revision: 0,
            }),
        }
    }

    /// Fold a batch of snapshots. Returns how many changed local state.
    pub fn apply(&mut self, jobs: impl IntoIterator<Item = Job>) -> usize {
        jobs.into_iter().filter(|job| self.apply_one(job)).count()
    }

    /// Empty state is seeded by the snapshot; otherwise the entry for the same
    /// file is updated in place and unknown files are appended. A snapshot
    /// older than the one already held for the same job is ignored.
    pub fn apply_one(&mut self, job: &Job) -> bool {
        let Some(file_name) = job.file_name() else {
            return false;
        };

        match self.statuses.iter_mut().find(|s| s.file_name == file_name) {
            Some(entry) => {
                let same_job = entry.job_id.as_deref() == Some(job.job_id.as_str());
                if same_job && job.revision < entry.revision {
                    return false;
                }
                entry.job_id = Some(job.job_id.clone());
                entry.status = job.status;
                entry.stats = job.stats().cloned();
                entry.error = job.error.clone();
                entry.revision = job.revision;
            }
            None => self.statuses.push(FileStatus::from_job(file_name, job)),
        }

        if job.status.is_terminal() {
            self.active_job_ids.retain(|id| id != &job.job_id);
        }
        true
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.active_job_ids.clear();
    }
}
