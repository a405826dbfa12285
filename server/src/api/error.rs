use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::refresh::{RefreshError, Stage};

/// Structured JSON error body returned by all API error responses.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Unified application error type.
///
/// Implements [`IntoResponse`] so handlers can return `Result<T, AppError>`
/// and axum will convert errors into structured JSON responses with the
/// appropriate HTTP status code.
#[derive(Debug)]
pub enum AppError {
    /// No vendor matches the address (404).
    NotFound,
    /// Internal server error (500).
    Internal(String),
    /// The reference source returned an error or was unreachable (502).
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "No vendor registered for this address".to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
        };
        (status, Json(ApiErrorBody { code, message })).into_response()
    }
}

impl From<RefreshError> for AppError {
    fn from(e: RefreshError) -> Self {
        match e.stage() {
            Stage::Download => AppError::BadGateway(e.to_string()),
            Stage::Init | Stage::Write => AppError::Internal(e.to_string()),
        }
    }
}
