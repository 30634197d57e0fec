use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::job::Job;

/// GET /api/v1/jobs/{job_id} — current snapshot, for clients that missed broadcasts.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, StatusCode> {
    match state.status.get_job(&job_id).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Job lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
