use axum::{routing::get, Router};

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod ws;

/// Gateway routes that depend on [`AppState`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ws", get(ws::progress_socket))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job))
        .with_state(state)
}
