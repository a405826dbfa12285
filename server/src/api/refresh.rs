use axum::{extract::State, http::StatusCode, Json};

use super::{error::AppError, AppState};
use crate::coordinator::StatusReport;

/// GET /api/v1/status — index statistics and refresh history.
pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.coordinator.status())
}

/// POST /api/v1/refresh — download the reference file now.
///
/// Returns 202 once the new file is on disk; the index is rebuilt in the
/// background right after.
pub async fn trigger(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.coordinator.refresh().await?;
    Ok(StatusCode::ACCEPTED)
}
