use std::sync::Arc;

use crate::services::{gateway::ProgressHub, job_status::JobStatusService, store::JobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub status: Arc<JobStatusService>,
    pub hub: ProgressHub,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, status: JobStatusService, hub: ProgressHub) -> Self {
        Self {
            store,
            status: Arc::new(status),
            hub,
        }
    }
}
