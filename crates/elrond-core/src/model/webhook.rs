//! Webhook registrations and transition payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    pub url: String,
    pub create_at: i64,
    pub delete_at: i64,
}

/// The entity kind a webhook payload refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEntityType {
    Ring,
    InstallationGroup,
}

/// The payload POSTed to every registered webhook after a state
/// transition has been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: WebhookEntityType,
    pub new_state: String,
    pub old_state: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_data: BTreeMap<String, String>,
}

/// Parameters constraining a set of webhooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookFilter {
    pub page: i64,
    pub per_page: i64,
    pub include_deleted: bool,
}

impl WebhookFilter {
    /// A filter returning every live webhook.
    #[must_use]
    pub fn all() -> Self {
        Self {
            page: 0,
            per_page: super::ALL_PER_PAGE,
            include_deleted: false,
        }
    }
}
