//! Ring endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{error, info};

use elrond_core::model::{
    now_ns, CreateRingRequest, InstallationGroup, InstallationGroupState, Paging, Ring,
    RingFilter, RingRelease, RingReleaseRequest, RingState, UpdateRingRequest, WebhookEntityType,
    WebhookPayload, PROVISIONER_NAME,
};
use elrond_core::release;

use super::{ensure_not_api_locked, lock_ring, ApiError, AppState};

fn ring_filter(paging: &Paging) -> RingFilter {
    RingFilter {
        page: paging.page,
        per_page: paging.per_page,
        include_deleted: paging.include_deleted,
    }
}

fn send_transition_webhook(
    state: &AppState,
    ring: &Ring,
    old_state: &str,
    with_environment: bool,
) {
    let mut extra_data = BTreeMap::new();
    if with_environment && !state.environment.is_empty() {
        extra_data.insert("Environment".to_string(), state.environment.clone());
    }
    state.webhooks.send_to_all(
        &state.store,
        &WebhookPayload {
            timestamp: now_ns(),
            id: ring.id.clone(),
            name: ring.name.clone(),
            entity_type: WebhookEntityType::Ring,
            new_state: ring.state.to_string(),
            old_state: old_state.to_string(),
            extra_data,
        },
    );
}

/// `GET /api/rings`: the requested page of rings with their groups.
pub(super) async fn get_rings(
    State(state): State<Arc<AppState>>,
    Query(paging): Query<Paging>,
) -> Result<Json<Vec<Ring>>, ApiError> {
    let filter = ring_filter(&paging);
    let mut rings = state.store.get_rings(&filter)?;
    let mut groups = state.store.get_installation_groups_for_rings(&filter)?;

    for ring in &mut rings {
        if let Some(ring_groups) = groups.remove(&ring.id) {
            ring.installation_groups = ring_groups;
        }
    }

    Ok(Json(rings))
}

/// `GET /api/ring/{id}`: ring detail including installation groups.
pub(super) async fn get_ring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Ring>, ApiError> {
    let mut ring = state.store.get_ring(&id)?.ok_or(ApiError::NotFound)?;
    ring.installation_groups = state.store.get_installation_groups_for_ring(&id)?;
    Ok(Json(ring))
}

/// `GET /api/release/{id}`: release detail.
pub(super) async fn get_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RingRelease>, ApiError> {
    let release = state.store.get_ring_release(&id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(release))
}

/// `POST /api/rings`: begin creating a new ring.
pub(super) async fn create_ring(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<CreateRingRequest>,
) -> Result<(StatusCode, Json<Ring>), ApiError> {
    request.set_defaults();
    request.validate()?;

    // The initial release pins the ring's identity even before any
    // rollout, so desiredReleaseID is always a valid record.
    let initial = state
        .store
        .get_or_create_ring_release(&RingRelease {
            id: String::new(),
            image: request.image.clone(),
            version: request.version.clone(),
            force: false,
            env_variables: BTreeMap::new(),
            readiness_probe: None,
            liveness_probe: None,
            create_at: 0,
        })?;

    let mut ring = Ring {
        id: String::new(),
        name: request.name.clone(),
        priority: request.priority,
        soak_time: request.soak_time,
        state: RingState::CreationRequested,
        provisioner: PROVISIONER_NAME.to_string(),
        active_release_id: initial.id.clone(),
        desired_release_id: initial.id,
        create_at: 0,
        delete_at: 0,
        release_at: 0,
        api_security_lock: request.api_security_lock,
        lock_acquired_by: None,
        lock_acquired_at: 0,
        installation_groups: Vec::new(),
    };

    let mut group = request.installation_group.as_ref().and_then(|register| {
        if register.name.is_empty() {
            return None;
        }
        Some(InstallationGroup {
            id: String::new(),
            name: register.name.clone(),
            state: InstallationGroupState::Stable,
            release_at: 0,
            soak_time: register.soak_time,
            provisioner_group_id: register.provisioner_group_id.clone(),
            lock_acquired_by: None,
            lock_acquired_at: 0,
        })
    });

    state.store.create_ring(&mut ring, group.as_mut())?;
    if let Some(group) = group {
        ring.installation_groups.push(group);
    }

    info!(ring = %ring.id, name = %ring.name, "ring creation requested");
    send_transition_webhook(&state, &ring, "n/a", false);
    state.scheduler.poke();

    Ok((StatusCode::ACCEPTED, Json(ring)))
}

/// `POST /api/ring/{id}`: retry a previously failed creation.
pub(super) async fn retry_create_ring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Ring>), ApiError> {
    let (mut ring, mut lock) = lock_ring(&state, &id)?;

    let new_state = RingState::CreationRequested;
    if !ring.valid_transition_to(new_state) {
        return Err(ApiError::Validation(format!(
            "unable to retry ring creation while in state {}",
            ring.state
        )));
    }

    if ring.state != new_state {
        let old_state = ring.state;
        ring.state = new_state;
        state.store.update_ring(&ring)?;
        send_transition_webhook(&state, &ring, old_state.as_str(), false);
    }

    // Poke even when nothing changed, to expedite the no-op paths too.
    lock.release();
    state.scheduler.poke();

    Ok((StatusCode::ACCEPTED, Json(ring)))
}

/// `POST /api/ring/{id}/update`: patch name, priority, or soak time.
pub(super) async fn update_ring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRingRequest>,
) -> Result<(StatusCode, Json<Ring>), ApiError> {
    let (mut ring, _lock) = lock_ring(&state, &id)?;
    ensure_not_api_locked(&ring)?;

    if let Some(name) = request.name {
        if !name.is_empty() {
            ring.name = name;
        }
    }
    if let Some(priority) = request.priority {
        if priority > 0 {
            ring.priority = priority;
        }
    }
    if let Some(soak_time) = request.soak_time {
        if soak_time > 0 {
            ring.soak_time = soak_time;
        }
    }

    state.store.update_ring(&ring)?;

    Ok((StatusCode::ACCEPTED, Json(ring)))
}

/// `POST /api/ring/{id}/release`: submit a release for one ring.
pub(super) async fn release_ring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RingReleaseRequest>,
) -> Result<(StatusCode, Json<Ring>), ApiError> {
    let (mut ring, mut lock) = lock_ring(&state, &id)?;
    ensure_not_api_locked(&ring)?;
    request.validate()?;

    let release = state
        .store
        .get_or_create_ring_release(&release::release_from_request(&request))?;

    let new_state = RingState::ReleasePending;
    if !ring.valid_transition_to(new_state) {
        return Err(ApiError::Validation(format!(
            "unable to release ring while in state {}",
            ring.state
        )));
    }

    if ring.state != new_state || ring.desired_release_id != release.id {
        let old_state = ring.state;
        ring.desired_release_id = release.id;
        ring.state = new_state;
        state.store.update_ring(&ring)?;

        if old_state != new_state {
            send_transition_webhook(&state, &ring, old_state.as_str(), true);
        }
    }

    // Poke even when nothing changed, to expedite the no-op paths too.
    lock.release();
    state.scheduler.poke();

    Ok((StatusCode::ACCEPTED, Json(ring)))
}

/// `DELETE /api/ring/{id}`: request ring deletion.
pub(super) async fn delete_ring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (mut ring, mut lock) = lock_ring(&state, &id)?;
    ensure_not_api_locked(&ring)?;

    let new_state = RingState::DeletionRequested;
    if !ring.valid_transition_to(new_state) {
        return Err(ApiError::Validation(format!(
            "unable to delete ring while in state {}",
            ring.state
        )));
    }

    if ring.state != new_state {
        let old_state = ring.state;
        ring.state = new_state;
        state.store.update_ring(&ring)?;
        send_transition_webhook(&state, &ring, old_state.as_str(), false);
    }

    lock.release();
    state.scheduler.poke();

    Ok(StatusCode::ACCEPTED)
}

/// `POST /api/rings/release`: release every ring whose active release
/// differs from the requested one.
pub(super) async fn release_all(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RingReleaseRequest>,
) -> Result<(StatusCode, Json<Vec<Ring>>), ApiError> {
    request.validate()?;

    let rings = release::release_all_rings(
        &state.store,
        &state.webhooks,
        &request,
        &state.environment,
    )
    .map_err(|err| {
        error!(error = %err, "failed to release all rings");
        ApiError::from(err)
    })?;

    state.scheduler.poke();
    Ok((StatusCode::ACCEPTED, Json(rings)))
}

/// `POST /api/rings/release/pause`: pause all pending releases.
pub(super) async fn pause_release(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Vec<Ring>>), ApiError> {
    let rings = release::pause_release(&state.store, &state.webhooks)?;
    Ok((StatusCode::ACCEPTED, Json(rings)))
}

/// `POST /api/rings/release/resume`: resume all paused releases.
pub(super) async fn resume_release(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Vec<Ring>>), ApiError> {
    let rings = release::resume_release(&state.store, &state.webhooks)?;
    state.scheduler.poke();
    Ok((StatusCode::ACCEPTED, Json(rings)))
}

/// `POST /api/rings/release/cancel`: cancel all pending releases.
pub(super) async fn cancel_release(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Vec<Ring>>), ApiError> {
    let rings = release::cancel_release(&state.store, &state.webhooks)?;
    Ok((StatusCode::ACCEPTED, Json(rings)))
}
