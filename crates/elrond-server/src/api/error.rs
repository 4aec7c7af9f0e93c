//! API error to HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use elrond_core::model::ValidationError;
use elrond_core::release::ReleaseError;
use elrond_core::store::StoreError;

/// Errors surfaced by the API handlers.
///
/// Internal details are logged, never returned to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// User-caused: missing field, invalid transition, bad paging.
    #[error("{0}")]
    Validation(String),

    /// The ring's API security lock rejects all mutations.
    #[error("api security lock is set")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// Row lock contention or a unique-index violation.
    #[error("{0}")]
    Conflict(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Validation(message) | Self::Conflict(message) => message.clone(),
            Self::Forbidden => "api security lock is set".to_string(),
            Self::NotFound => "not found".to_string(),
            Self::Internal(message) => {
                error!(error = %message, "internal API error");
                "internal server error".to_string()
            }
        };
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_unique_violation() {
            return Self::Conflict("already exists".to_string());
        }
        match err {
            StoreError::NotFound { .. } => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ReleaseError> for ApiError {
    fn from(err: ReleaseError) -> Self {
        match err {
            // A release already pending elsewhere aborts the whole
            // request as a server-side failure.
            ReleaseError::ReleaseInProgress => Self::Internal(err.to_string()),
            ReleaseError::ApiSecurityLocked { .. } => Self::Forbidden,
            ReleaseError::InvalidTransition { .. } => Self::Validation(err.to_string()),
            ReleaseError::LockContention => Self::Conflict(err.to_string()),
            ReleaseError::Store(store_err) => store_err.into(),
        }
    }
}
