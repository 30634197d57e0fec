use serde::Deserialize;
use std::time::Duration;

/// What happens to updates that target a job already in `done` or `error`.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalPolicy {
    /// Apply them like any other update.
    #[default]
    Accept,
    /// Refuse them, except a reset back to `queued`.
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job store, queue and progress channel
    pub redis_url: String,

    /// Retries after the first failed store round-trip
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed backoff between retries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Sliding lifetime of a job snapshot
    #[serde(default = "default_job_ttl_seconds")]
    pub job_ttl_seconds: u64,

    /// Idle poll interval for the worker and the HTTP status poller
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Rows processed between two progress updates
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay before the progress client reconnects after an abnormal close
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Store key prefix, the job id is appended verbatim
    #[serde(default = "default_job_key_prefix")]
    pub job_key_prefix: String,

    /// Pub/sub channel carrying progress snapshots
    #[serde(default = "default_progress_channel")]
    pub progress_channel: String,

    #[serde(default)]
    pub terminal_policy: TerminalPolicy,

    /// WebSocket endpoint of the progress gateway
    #[serde(default = "default_progress_url")]
    pub progress_url: String,

    /// HTTP base URL of the gateway, used for point reads
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_job_ttl_seconds() -> u64 {
    86_400
}

fn default_polling_interval_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_job_key_prefix() -> String {
    "import-job:".to_string()
}

fn default_progress_channel() -> String {
    "import:progress".to_string()
}

fn default_progress_url() -> String {
    "ws://localhost:3000/ws".to_string()
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn job_processing(&self) -> JobProcessingConfig {
        JobProcessingConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            job_ttl: Duration::from_secs(self.job_ttl_seconds),
            key_prefix: self.job_key_prefix.clone(),
            progress_channel: self.progress_channel.clone(),
            terminal_policy: self.terminal_policy,
            chunk_size: self.chunk_size,
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            progress_url: self.progress_url.clone(),
            api_base_url: self.api_base_url.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
        }
    }
}

/// Settings of the job status service and the producer side.
#[derive(Debug, Clone)]
pub struct JobProcessingConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub job_ttl: Duration,
    pub key_prefix: String,
    pub progress_channel: String,
    pub terminal_policy: TerminalPolicy,
    pub chunk_size: usize,
}

impl Default for JobProcessingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: Duration::from_millis(default_retry_delay_ms()),
            job_ttl: Duration::from_secs(default_job_ttl_seconds()),
            key_prefix: default_job_key_prefix(),
            progress_channel: default_progress_channel(),
            terminal_policy: TerminalPolicy::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl JobProcessingConfig {
    pub fn job_key(&self, job_id: &str) -> String {
        format!("{}{}", self.key_prefix, job_id)
    }
}

/// Settings of the progress client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub progress_url: String,
    pub api_base_url: String,
    pub reconnect_delay: Duration,
    pub polling_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            progress_url: default_progress_url(),
            api_base_url: default_api_base_url(),
            reconnect_delay: Duration::from_millis(default_reconnect_delay_ms()),
            polling_interval: Duration::from_millis(default_polling_interval_ms()),
        }
    }
}
