use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::ClientError;
use crate::config::ClientConfig;
use crate::models::job::Job;

/// Polling fallback for consumers that cannot hold a progress stream open.
pub struct StatusPoller {
    http: reqwest::Client,
    base_url: String,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            interval: config.polling_interval,
        }
    }

    /// Point read of a job snapshot; `None` when the gateway has no such job.
    pub async fn fetch(&self, job_id: &str) -> Result<Option<Job>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/jobs/{}", self.base_url, job_id))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<Job>().await?)),
            status => Err(ClientError::Status(status.as_u16())),
        }
    }

    /// Poll until the job reaches `done` or `error`, or `timeout` elapses.
    pub async fn wait_until_resolved(&self, job_id: &str, timeout: Duration) -> Result<Job, ClientError> {
        let started = Instant::now();
        loop {
            match self.fetch(job_id).await? {
                Some(job) if job.status.is_terminal() => return Ok(job),
                Some(job) => debug!(job_id = %job_id, status = %job.status, "job still running"),
                None => return Err(ClientError::NotFound(job_id.to_string())),
            }

            if started.elapsed() + self.interval > timeout {
                return Err(ClientError::Timeout {
                    job_id: job_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            sleep(self.interval).await;
        }
    }
}
