//! HTTP control plane.
//!
//! Thin handlers over the core: every mutation writes the requested
//! state through the store under a row lock, emits a webhook after the
//! commit, and pokes the scheduler to expedite the next supervisor
//! cycle.

mod error;
mod installation_group;
mod ring;
mod security;
mod webhook;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tracing::{error, warn};

use elrond_core::model::{new_id, Ring};
use elrond_core::store::Store;
use elrond_core::supervisor::Scheduler;
use elrond_core::webhook::WebhookSender;

/// Shared state for all API handlers.
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub webhooks: WebhookSender,
    /// Reported as `Environment` in webhook payload extra data.
    pub environment: String,
}

/// Builds the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/rings", get(ring::get_rings).post(ring::create_ring))
        .route("/api/rings/release", post(ring::release_all))
        .route("/api/rings/release/pause", post(ring::pause_release))
        .route("/api/rings/release/resume", post(ring::resume_release))
        .route("/api/rings/release/cancel", post(ring::cancel_release))
        .route(
            "/api/ring/{id}",
            get(ring::get_ring)
                .post(ring::retry_create_ring)
                .delete(ring::delete_ring),
        )
        .route("/api/ring/{id}/update", post(ring::update_ring))
        .route("/api/ring/{id}/release", post(ring::release_ring))
        .route(
            "/api/ring/{id}/installationgroup",
            post(installation_group::register),
        )
        .route(
            "/api/ring/{id}/installationgroup/{group_id}",
            delete(installation_group::remove),
        )
        .route(
            "/api/installationgroup/{id}/update",
            post(installation_group::update),
        )
        .route("/api/release/{id}", get(ring::get_release))
        .route("/api/webhooks", get(webhook::list).post(webhook::create))
        .route(
            "/api/webhook/{id}",
            get(webhook::get).delete(webhook::remove),
        )
        .route("/api/security/ring/{id}/api/lock", post(security::lock))
        .route("/api/security/ring/{id}/api/unlock", post(security::unlock))
        .with_state(state)
}

/// A held ring row lock that releases on drop, so every handler exit
/// path unlocks. `release` may be called early to unlock before poking
/// the scheduler.
pub(crate) struct RingLock {
    store: Arc<Store>,
    ring_id: String,
    locker_id: String,
    released: bool,
}

impl RingLock {
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.store.unlock_ring(&self.ring_id, &self.locker_id, false) {
            Ok(true) => {}
            Ok(false) => error!(ring = %self.ring_id, "failed to release lock for ring"),
            Err(err) => error!(ring = %self.ring_id, error = %err, "failed to unlock ring"),
        }
    }
}

impl Drop for RingLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fetches and row-locks a ring on behalf of one API request.
pub(crate) fn lock_ring(state: &AppState, ring_id: &str) -> Result<(Ring, RingLock), ApiError> {
    let ring = state
        .store
        .get_ring(ring_id)?
        .ok_or(ApiError::NotFound)?;

    let locker_id = new_id();
    if !state.store.lock_ring(ring_id, &locker_id)? {
        warn!(ring = %ring_id, "failed to acquire lock for ring");
        return Err(ApiError::Conflict("ring is locked".into()));
    }

    Ok((
        ring,
        RingLock {
            store: Arc::clone(&state.store),
            ring_id: ring_id.to_string(),
            locker_id,
            released: false,
        },
    ))
}

/// Rejects the request when the ring's API security lock is set.
pub(crate) fn ensure_not_api_locked(ring: &Ring) -> Result<(), ApiError> {
    if ring.api_security_lock {
        warn!(ring = %ring.id, "api security lock is set for ring, blocking the request");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}
