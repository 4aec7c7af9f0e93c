//! The installation group entity.

use serde::{Deserialize, Serialize};

use super::InstallationGroupState;

/// A deployment unit owned by the external provisioner. Elrond patches
/// the backing provisioner group's image, version, and environment to
/// effect a release. A group belongs to exactly one ring through the
/// membership table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationGroup {
    pub id: String,
    pub name: String,
    pub state: InstallationGroupState,
    /// Set when the group finishes releasing and enters soak or stable.
    pub release_at: i64,
    /// Seconds the group soaks after its provisioner rollout converges.
    pub soak_time: i64,
    #[serde(rename = "provisionerGroupID")]
    pub provisioner_group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl InstallationGroup {
    /// Returns whether the group may be transitioned to `new_state`.
    #[must_use]
    pub fn valid_transition_to(&self, new_state: InstallationGroupState) -> bool {
        self.state.valid_transition_to(new_state)
    }
}
