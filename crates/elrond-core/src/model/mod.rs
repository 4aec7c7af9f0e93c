//! Entities and state machines shared by the store, the supervisors, and
//! the HTTP control plane.

mod installation_group;
mod installation_group_state;
mod release;
mod request;
mod ring;
mod ring_state;
mod webhook;

pub use installation_group::InstallationGroup;
pub use installation_group_state::InstallationGroupState;
pub use release::RingRelease;
pub use request::{
    CreateRingRequest, CreateWebhookRequest, Paging, RegisterInstallationGroupRequest,
    RingReleaseRequest, UpdateInstallationGroupRequest, UpdateRingRequest, ValidationError,
};
pub use ring::{Ring, RingFilter};
pub use ring_state::RingState;
pub use webhook::{Webhook, WebhookEntityType, WebhookFilter, WebhookPayload};

use std::time::{SystemTime, UNIX_EPOCH};

/// The provisioner name recorded on every ring owned by this server.
pub const PROVISIONER_NAME: &str = "elrond";

/// `per_page` value that disables paging.
pub const ALL_PER_PAGE: i64 = -1;

/// Generates a new 26-character entity ID (Crockford base32, case
/// insensitive, lexicographically sortable by creation time).
#[must_use]
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_26_alphanumeric_chars() {
        let id = new_id();
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn new_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
