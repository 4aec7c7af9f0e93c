//! Release admission.
//!
//! Every write that binds a ring's `desiredReleaseID` goes through
//! [`Store::get_or_create_ring_release`], so identical release content
//! always resolves to one record. Set-level operations (release-all,
//! pause, resume, cancel) validate every ring before the first write,
//! acquire all needed row locks up front, and commit in one transaction.

use std::collections::BTreeMap;

use crate::model::{
    new_id, now_ns, Ring, RingFilter, RingReleaseRequest, RingRelease, RingState,
    WebhookEntityType, WebhookPayload,
};
use crate::store::{Store, StoreError};
use crate::webhook::WebhookSender;

/// Errors from release admission operations.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Another release is already pending somewhere in the fleet.
    #[error("a ring release is already pending, cannot start another")]
    ReleaseInProgress,

    /// A ring in the batch is protected by its API security lock.
    #[error("ring {ring} is API security locked")]
    ApiSecurityLocked { ring: String },

    /// A ring in the batch cannot legally enter the requested state.
    #[error("ring {ring} cannot transition from {state} to {requested}")]
    InvalidTransition {
        ring: String,
        state: RingState,
        requested: RingState,
    },

    /// Row locks for the batch could not be acquired.
    #[error("failed to acquire locks for rings under release")]
    LockContention,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds the release record described by an API request.
#[must_use]
pub fn release_from_request(request: &RingReleaseRequest) -> RingRelease {
    RingRelease {
        id: String::new(),
        image: request.image.clone(),
        version: request.version.clone(),
        force: request.force,
        env_variables: request.env_variables.clone(),
        readiness_probe: request.readiness_probe.clone(),
        liveness_probe: request.liveness_probe.clone(),
        create_at: 0,
    }
}

fn transition_payload(ring: &Ring, old_state: RingState, environment: &str) -> WebhookPayload {
    let mut extra_data = BTreeMap::new();
    if !environment.is_empty() {
        extra_data.insert("Environment".to_string(), environment.to_string());
    }
    WebhookPayload {
        timestamp: now_ns(),
        id: ring.id.clone(),
        name: ring.name.clone(),
        entity_type: WebhookEntityType::Ring,
        new_state: ring.state.to_string(),
        old_state: old_state.to_string(),
        extra_data,
    }
}

/// Targets every live ring whose active release differs from the
/// requested one with a new pending release. Refused while any ring is
/// release-pending or release-paused; the whole batch fails before any
/// write when a ring is API-locked or cannot transition.
///
/// # Errors
///
/// See [`ReleaseError`].
pub fn release_all_rings(
    store: &Store,
    sender: &WebhookSender,
    request: &RingReleaseRequest,
    environment: &str,
) -> Result<Vec<Ring>, ReleaseError> {
    if !store.get_rings_in_pending_state()?.is_empty() {
        return Err(ReleaseError::ReleaseInProgress);
    }

    let release = store.get_or_create_ring_release(&release_from_request(request))?;
    let rings = store.get_rings(&RingFilter::all())?;

    if let Some(locked) = rings.iter().find(|r| r.api_security_lock) {
        return Err(ReleaseError::ApiSecurityLocked {
            ring: locked.id.clone(),
        });
    }

    let mut targets: Vec<Ring> = rings
        .into_iter()
        .filter(|ring| ring.active_release_id != release.id)
        .collect();
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    for ring in &targets {
        if !ring.valid_transition_to(RingState::ReleasePending) {
            return Err(ReleaseError::InvalidTransition {
                ring: ring.id.clone(),
                state: ring.state,
                requested: RingState::ReleasePending,
            });
        }
    }

    let locker_id = new_id();
    let ids: Vec<String> = targets.iter().map(|r| r.id.clone()).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    if !store.lock_rings(&id_refs, &locker_id)? {
        return Err(ReleaseError::LockContention);
    }

    let mut old_states = Vec::with_capacity(targets.len());
    for ring in &mut targets {
        old_states.push(ring.state);
        ring.state = RingState::ReleasePending;
        ring.desired_release_id = release.id.clone();
    }

    let update_result = store.update_rings(&targets);
    let unlock_result = store.unlock_rings(&id_refs, &locker_id, false);
    update_result?;
    unlock_result?;

    for (index, ring) in targets.iter().enumerate() {
        sender.send_to_all(store, &transition_payload(ring, old_states[index], environment));
    }

    Ok(targets)
}

/// Pauses every ring with a pending release.
///
/// # Errors
///
/// See [`ReleaseError`].
pub fn pause_release(store: &Store, sender: &WebhookSender) -> Result<Vec<Ring>, ReleaseError> {
    transition_pending_rings(store, sender, RingState::ReleasePaused, false)
}

/// Resumes every paused release.
///
/// # Errors
///
/// See [`ReleaseError`].
pub fn resume_release(store: &Store, sender: &WebhookSender) -> Result<Vec<Ring>, ReleaseError> {
    transition_pending_rings(store, sender, RingState::ReleasePending, false)
}

/// Cancels every pending or paused release, returning the rings to
/// stable with their desired release reset to the active one. Rings
/// already past admission cannot be cancelled.
///
/// # Errors
///
/// See [`ReleaseError`].
pub fn cancel_release(store: &Store, sender: &WebhookSender) -> Result<Vec<Ring>, ReleaseError> {
    transition_pending_rings(store, sender, RingState::Stable, true)
}

fn transition_pending_rings(
    store: &Store,
    sender: &WebhookSender,
    new_state: RingState,
    reset_desired: bool,
) -> Result<Vec<Ring>, ReleaseError> {
    let pending = store.get_rings_in_pending_state()?;

    let mut targets: Vec<Ring> = pending
        .into_iter()
        .filter(|ring| ring.state != new_state)
        .collect();
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    // Cancel is a direct reset; pause and resume follow the transition
    // table.
    if !reset_desired {
        for ring in &targets {
            if !ring.valid_transition_to(new_state) {
                return Err(ReleaseError::InvalidTransition {
                    ring: ring.id.clone(),
                    state: ring.state,
                    requested: new_state,
                });
            }
        }
    }

    let locker_id = new_id();
    let ids: Vec<String> = targets.iter().map(|r| r.id.clone()).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    if !store.lock_rings(&id_refs, &locker_id)? {
        return Err(ReleaseError::LockContention);
    }

    let mut old_states = Vec::with_capacity(targets.len());
    for ring in &mut targets {
        old_states.push(ring.state);
        ring.state = new_state;
        if reset_desired {
            ring.desired_release_id = ring.active_release_id.clone();
        }
    }

    let update_result = store.update_rings(&targets);
    let unlock_result = store.unlock_rings(&id_refs, &locker_id, false);
    update_result?;
    unlock_result?;

    for (index, ring) in targets.iter().enumerate() {
        sender.send_to_all(store, &transition_payload(ring, old_states[index], ""));
    }

    Ok(targets)
}
