//! HTTP client for the external provisioner's group API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ProvisionerError;

/// A group as reported by the external provisioner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionerGroup {
    pub id: String,
    pub name: String,
    pub image: String,
    pub version: String,
    pub env_variables: BTreeMap<String, String>,
}

/// Rollout progress of a provisioner group.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionerGroupStatus {
    pub installations_awaiting_update: i64,
    pub installations_updating: i64,
}

impl ProvisionerGroupStatus {
    /// A group has converged when no installation is awaiting or
    /// applying an update.
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.installations_awaiting_update == 0 && self.installations_updating == 0
    }
}

/// A patch applied to a provisioner group to effect a release.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPatch {
    pub id: String,
    pub image: String,
    pub version: String,
    pub env_variables: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<serde_json::Value>,
}

/// The subset of the external provisioner API elrond consumes.
///
/// Supervisor tests substitute an in-memory fake for this trait.
#[async_trait]
pub trait ProvisionerApi: Send + Sync {
    /// Fetches a group by its provisioner-side ID.
    async fn get_group(&self, id: &str) -> Result<ProvisionerGroup, ProvisionerError>;

    /// Patches a group's image, version, environment, and probes.
    async fn patch_group(&self, patch: &GroupPatch) -> Result<(), ProvisionerError>;

    /// Fetches rollout progress for a group.
    async fn get_group_status(&self, id: &str)
        -> Result<ProvisionerGroupStatus, ProvisionerError>;
}

/// [`ProvisionerApi`] implementation over the provisioner's HTTP API.
pub struct HttpProvisionerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvisionerClient {
    /// Creates a client for the provisioner at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProvisionerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProvisionerApi for HttpProvisionerClient {
    async fn get_group(&self, id: &str) -> Result<ProvisionerGroup, ProvisionerError> {
        let response = self
            .client
            .get(self.url(&format!("/api/group/{id}")))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProvisionerError::GroupNotFound { id: id.to_string() });
        }
        if !response.status().is_success() {
            return Err(ProvisionerError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    async fn patch_group(&self, patch: &GroupPatch) -> Result<(), ProvisionerError> {
        let response = self
            .client
            .put(self.url(&format!("/api/group/{}", patch.id)))
            .json(patch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisionerError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn get_group_status(
        &self,
        id: &str,
    ) -> Result<ProvisionerGroupStatus, ProvisionerError> {
        let response = self
            .client
            .get(self.url(&format!("/api/group/{id}/status")))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisionerError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_convergence() {
        assert!(ProvisionerGroupStatus {
            installations_awaiting_update: 0,
            installations_updating: 0,
        }
        .converged());
        assert!(!ProvisionerGroupStatus {
            installations_awaiting_update: 1,
            installations_updating: 0,
        }
        .converged());
        assert!(!ProvisionerGroupStatus {
            installations_awaiting_update: 0,
            installations_updating: 3,
        }
        .converged());
    }

    #[test]
    fn url_joins_without_duplicate_slash() {
        let client = HttpProvisionerClient::new("http://localhost:8075/").unwrap();
        assert_eq!(
            client.url("/api/group/pg1"),
            "http://localhost:8075/api/group/pg1"
        );
    }
}
