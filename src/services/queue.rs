use base64::Engine;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::JobProcessingConfig;
use crate::models::job::Job;
use crate::services::store::{JobStore, StoreError};

const QUEUE_KEY: &str = "import:jobs";
const PROCESSING_KEY: &str = "import:processing";

/// Import payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedImport {
    pub job_id: String,
    pub file_name: String,
    pub user_id: Option<String>,
    /// Base64-encoded CSV body.
    pub csv_content: String,
}

impl QueuedImport {
    pub fn new(file_name: impl Into<String>, csv: &str, user_id: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            user_id,
            csv_content: base64::engine::general_purpose::STANDARD.encode(csv),
        }
    }

    pub fn decode_content(&self) -> Result<String, QueueError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&self.csv_content)?;
        String::from_utf8(bytes).map_err(|e| QueueError::Content(e.to_string()))
    }
}

/// Redis-backed import queue.
///
/// Enqueueing also seeds the job's `queued` snapshot, which is what makes the
/// job visible to the status service.
pub struct JobQueue {
    client: redis::Client,
    store: Arc<dyn JobStore>,
    config: JobProcessingConfig,
    queue_key: String,
    processing_key: String,
}

impl JobQueue {
    pub fn new(
        redis_url: &str,
        store: Arc<dyn JobStore>,
        config: JobProcessingConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            store,
            config,
            queue_key: QUEUE_KEY.to_string(),
            processing_key: PROCESSING_KEY.to_string(),
        })
    }

    /// Use other list names, e.g. to keep separate deployments apart.
    pub fn with_keys(mut self, queue_key: impl Into<String>, processing_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self.processing_key = processing_key.into();
        self
    }

    /// Seed the snapshot and enqueue the import. Returns the seeded snapshot.
    pub async fn enqueue(&self, job: &QueuedImport) -> Result<Job, QueueError> {
        let snapshot = Job::queued_import(&job.job_id, &job.file_name, job.user_id.clone());
        let serialized = serde_json::to_string(&snapshot)?;
        self.store
            .set(&self.config.job_key(&job.job_id), &serialized, self.config.job_ttl)
            .await?;

        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(&self.queue_key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(snapshot)
    }

    /// Dequeue an import for processing (moves it to the processing list).
    pub async fn dequeue(&self) -> Result<Option<QueuedImport>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(&self.queue_key, &self.processing_key)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending imports).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(&self.queue_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Remove a finished import from the processing list.
    pub async fn complete(&self, job: &QueuedImport) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job)?;
        conn.lrem::<_, _, ()>(&self.processing_key, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Move an interrupted import from the processing list back to the front
    /// of the queue, so it is the next one dequeued.
    pub async fn requeue(&self, job: &QueuedImport) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job)?;
        redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &payload)
            .ignore()
            .rpush(&self.queue_key, &payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid base64 content: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Invalid CSV content: {0}")]
    Content(String),
}
