//! API security lock endpoints.
//!
//! The security lock rejects all mutating API calls for a ring until
//! cleared; supervisors are unaffected.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;

use super::{ApiError, AppState};

/// `POST /api/security/ring/{id}/api/lock`.
pub(super) async fn lock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ring = state.store.get_ring(&id)?.ok_or(ApiError::NotFound)?;
    if !ring.api_security_lock {
        state.store.lock_ring_api(&ring.id)?;
    }
    Ok(StatusCode::OK)
}

/// `POST /api/security/ring/{id}/api/unlock`.
pub(super) async fn unlock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ring = state.store.get_ring(&id)?.ok_or(ApiError::NotFound)?;
    if ring.api_security_lock {
        state.store.unlock_ring_api(&ring.id)?;
    }
    Ok(StatusCode::OK)
}
