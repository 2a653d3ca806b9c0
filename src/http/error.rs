use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::deploy::WorkDirError;
use crate::forge::ProviderError;
use crate::git::BranchError;
use crate::registry::{RegistryError, RepoIdError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// No usable token for the requested tenant.
    Unauthorized(String),
    /// The request body or path failed validation.
    Validation(String),
    NotFound(String),
    /// The provider answered with a failure.
    Provider(ProviderError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => json_error(StatusCode::UNAUTHORIZED, msg),
            AppError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, msg),
            AppError::Provider(err) if err.is_unauthorized() => {
                warn!(error = %err, "provider rejected the stored token");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({
                        "error": "provider rejected the stored token",
                        "reauthorize": true,
                    })),
                )
                    .into_response()
            }
            AppError::Provider(err) => {
                match &err {
                    ProviderError::Status { status, body } => {
                        error!(status, %body, "provider call failed")
                    }
                    other => error!(error = %other, "provider call failed"),
                }
                json_error(StatusCode::BAD_GATEWAY, "provider request failed")
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::Provider(err)
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(msg) => AppError::Validation(msg),
            RegistryError::Storage(e) => AppError::Internal(e),
        }
    }
}

impl From<RepoIdError> for AppError {
    fn from(err: RepoIdError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<WorkDirError> for AppError {
    fn from(err: WorkDirError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<BranchError> for AppError {
    fn from(err: BranchError) -> Self {
        AppError::Validation(err.to_string())
    }
}
