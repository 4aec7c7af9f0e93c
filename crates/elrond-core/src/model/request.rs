//! API request bodies and their validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default ring soak time when the create request leaves it unset.
pub const DEFAULT_RING_SOAK_TIME: i64 = 7200;

/// A request validation failure, surfaced to the caller as a 400.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Parameters for a new ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateRingRequest {
    pub name: String,
    pub priority: i64,
    /// Optional first installation group, registered atomically with the
    /// ring.
    pub installation_group: Option<RegisterInstallationGroupRequest>,
    pub soak_time: i64,
    pub image: String,
    pub version: String,
    pub api_security_lock: bool,
}

impl CreateRingRequest {
    pub fn set_defaults(&mut self) {
        if self.soak_time == 0 {
            self.soak_time = DEFAULT_RING_SOAK_TIME;
        }
    }

    /// # Errors
    ///
    /// Returns an error when `priority` is not a positive integer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.priority <= 0 {
            return Err(ValidationError("priority must be a positive integer".into()));
        }
        Ok(())
    }
}

/// Parameters to update a ring. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRingRequest {
    pub name: Option<String>,
    pub priority: Option<i64>,
    pub soak_time: Option<i64>,
}

/// Parameters for a ring release, single-ring or release-all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RingReleaseRequest {
    pub image: String,
    pub version: String,
    pub force: bool,
    pub env_variables: BTreeMap<String, String>,
    pub readiness_probe: Option<serde_json::Value>,
    pub liveness_probe: Option<serde_json::Value>,
}

impl RingReleaseRequest {
    /// # Errors
    ///
    /// Returns an error when the image or version is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.is_empty() {
            return Err(ValidationError("image is required".into()));
        }
        if self.version.is_empty() {
            return Err(ValidationError("version is required".into()));
        }
        Ok(())
    }
}

/// Parameters to register an installation group with a ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterInstallationGroupRequest {
    pub name: String,
    pub soak_time: i64,
    #[serde(rename = "provisionerGroupID")]
    pub provisioner_group_id: String,
}

impl RegisterInstallationGroupRequest {
    /// # Errors
    ///
    /// Returns an error when the group name is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError("installation group name is required".into()));
        }
        Ok(())
    }
}

/// Parameters to update an installation group. Unset fields are left
/// unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateInstallationGroupRequest {
    pub name: Option<String>,
    pub soak_time: Option<i64>,
    #[serde(rename = "provisionerGroupID")]
    pub provisioner_group_id: Option<String>,
}

/// Parameters to register a webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWebhookRequest {
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    pub url: String,
}

impl CreateWebhookRequest {
    /// # Errors
    ///
    /// Returns an error when the owner or URL is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner_id.is_empty() {
            return Err(ValidationError("ownerID is required".into()));
        }
        if self.url.is_empty() {
            return Err(ValidationError("url is required".into()));
        }
        Ok(())
    }
}

/// Paging query parameters shared by the list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Paging {
    pub page: i64,
    pub per_page: i64,
    pub include_deleted: bool,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: 100,
            include_deleted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_ring_defaults_soak_time() {
        let mut request = CreateRingRequest {
            priority: 1,
            ..Default::default()
        };
        request.set_defaults();
        assert_eq!(request.soak_time, DEFAULT_RING_SOAK_TIME);

        let mut request = CreateRingRequest {
            priority: 1,
            soak_time: 60,
            ..Default::default()
        };
        request.set_defaults();
        assert_eq!(request.soak_time, 60);
    }

    #[test]
    fn create_ring_requires_positive_priority() {
        let request = CreateRingRequest::default();
        assert!(request.validate().is_err());

        let request = CreateRingRequest {
            priority: -2,
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn release_requires_image_and_version() {
        let request = RingReleaseRequest::default();
        assert!(request.validate().is_err());

        let request = RingReleaseRequest {
            image: "app".into(),
            version: "1.0".into(),
            ..Default::default()
        };
        assert!(request.validate().is_ok());
    }
}
