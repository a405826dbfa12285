use axum::{
    extract::{Path, State},
    Json,
};

use super::{error::AppError, AppState};
use crate::oui::OuiMatch;

/// GET /api/v1/lookup/:address — resolve a MAC address to its vendor.
///
/// Unknown prefixes and malformed addresses are both a 404: callers cannot
/// tell "never loaded" from "not registered".
pub async fn get_one(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<OuiMatch>, AppError> {
    state
        .coordinator
        .lookup(&address)
        .map(Json)
        .ok_or(AppError::NotFound)
}
