//! Consumer side: streaming progress client, reconciliation and an HTTP
//! polling fallback.

pub mod connection;
pub mod poller;
pub mod tracker;

pub use connection::{ConnectionState, ProgressClient};
pub use poller::StatusPoller;
pub use tracker::{FileStatus, ImportTracker};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {0} from gateway")]
    Status(u16),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {job_id} did not resolve within {waited_ms}ms")]
    Timeout { job_id: String, waited_ms: u64 },
}
