//! The content-addressed ring release.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A release bundle targeted by rings via `desiredReleaseID` and promoted
/// to `activeReleaseID` on success.
///
/// Releases are deduplicated on the full content tuple `(image, version,
/// force, envVariables, readinessProbe, livenessProbe)`; submitting the
/// same bundle twice yields the same record. The environment map is a
/// `BTreeMap` so its serialized form is deterministic and equal logical
/// content compares equal in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingRelease {
    pub id: String,
    pub image: String,
    pub version: String,
    /// A forced release bypasses admission gates and both soak phases.
    pub force: bool,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    /// Opaque probe spec forwarded to the provisioner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<serde_json::Value>,
    /// Opaque probe spec forwarded to the provisioner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<serde_json::Value>,
    pub create_at: i64,
}

impl RingRelease {
    /// Serializes the environment map for storage and content comparison.
    #[must_use]
    pub fn env_variables_json(&self) -> String {
        serde_json::to_string(&self.env_variables).unwrap_or_else(|_| "{}".to_string())
    }

    /// Serializes a probe for storage and content comparison. `None`
    /// probes serialize to the empty string so equality is well defined.
    #[must_use]
    pub fn probe_json(probe: Option<&serde_json::Value>) -> String {
        probe
            .map(|p| p.to_string())
            .unwrap_or_default()
    }
}
