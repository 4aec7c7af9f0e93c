//! Installation group endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use elrond_core::model::{
    new_id, InstallationGroup, InstallationGroupState, RegisterInstallationGroupRequest, Ring,
    UpdateInstallationGroupRequest,
};

use super::{ensure_not_api_locked, lock_ring, ApiError, AppState};

/// `POST /api/ring/{id}/installationgroup`: register a group with the
/// ring.
pub(super) async fn register(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RegisterInstallationGroupRequest>,
) -> Result<Json<Ring>, ApiError> {
    let (mut ring, _lock) = lock_ring(&state, &id)?;
    ensure_not_api_locked(&ring)?;
    request.validate()?;

    let group = InstallationGroup {
        id: String::new(),
        name: request.name.clone(),
        state: InstallationGroupState::Stable,
        release_at: 0,
        soak_time: request.soak_time,
        provisioner_group_id: request.provisioner_group_id.clone(),
        lock_acquired_by: None,
        lock_acquired_at: 0,
    };
    let group = state
        .store
        .create_ring_installation_group(&ring.id, &group)?;

    info!(ring = %ring.id, installation_group = %group.id, "registered installation group");

    ring.installation_groups = state.store.get_installation_groups_for_ring(&ring.id)?;
    Ok(Json(ring))
}

/// `DELETE /api/ring/{id}/installationgroup/{group_id}`: remove a
/// group from the ring.
pub(super) async fn remove(
    State(state): State<Arc<AppState>>,
    Path((id, group_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let (ring, _lock) = lock_ring(&state, &id)?;
    ensure_not_api_locked(&ring)?;

    state
        .store
        .delete_ring_installation_group(&ring.id, &group_id)?;

    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/installationgroup/{id}/update`: patch a group's name,
/// soak time, or provisioner group.
pub(super) async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateInstallationGroupRequest>,
) -> Result<(StatusCode, Json<InstallationGroup>), ApiError> {
    let mut group = state
        .store
        .get_installation_group_by_id(&id)?
        .ok_or(ApiError::NotFound)?;

    let locker_id = new_id();
    if !state.store.lock_installation_group(&id, &locker_id)? {
        return Err(ApiError::Conflict("installation group is locked".into()));
    }

    let result = (|| {
        if let Some(name) = &request.name {
            if !name.is_empty() {
                group.name = name.clone();
            }
        }
        if let Some(soak_time) = request.soak_time {
            if soak_time > 0 {
                group.soak_time = soak_time;
            }
        }
        if let Some(provisioner_group_id) = &request.provisioner_group_id {
            if !provisioner_group_id.is_empty() {
                group.provisioner_group_id = provisioner_group_id.clone();
            }
        }
        state.store.update_installation_group(&group)
    })();

    let unlock_result = state.store.unlock_installation_group(&id, &locker_id, false);
    result?;
    unlock_result?;

    Ok((StatusCode::ACCEPTED, Json(group)))
}
