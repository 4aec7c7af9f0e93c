//! The ring entity.

use serde::{Deserialize, Serialize};

use super::{InstallationGroup, RingState};

/// A deployment ring: a prioritized set of installation groups that roll
/// out together under a shared soak policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ring {
    pub id: String,
    pub name: String,
    /// Lower value means higher priority during release admission.
    pub priority: i64,
    /// Seconds the ring soaks after its groups finish releasing.
    pub soak_time: i64,
    pub state: RingState,
    pub provisioner: String,
    #[serde(rename = "activeReleaseID")]
    pub active_release_id: String,
    #[serde(rename = "desiredReleaseID")]
    pub desired_release_id: String,
    pub create_at: i64,
    pub delete_at: i64,
    /// Set when the ring enters soak or becomes stable after a release.
    pub release_at: i64,
    pub api_security_lock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
    /// Member groups, populated on API reads; never stored on the row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installation_groups: Vec<InstallationGroup>,
}

impl Ring {
    /// Returns whether the ring may be transitioned to `new_state`.
    #[must_use]
    pub fn valid_transition_to(&self, new_state: RingState) -> bool {
        self.state.valid_transition_to(new_state)
    }
}

/// Parameters constraining a set of rings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingFilter {
    pub page: i64,
    pub per_page: i64,
    pub include_deleted: bool,
}

impl RingFilter {
    /// A filter returning every live ring.
    #[must_use]
    pub fn all() -> Self {
        Self {
            page: 0,
            per_page: super::ALL_PER_PAGE,
            include_deleted: false,
        }
    }
}
