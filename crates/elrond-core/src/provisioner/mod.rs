//! Typed facade over the external provisioner.
//!
//! Supervisors drive releases exclusively through the capability traits
//! defined here, so unit tests can substitute in-memory fakes for the
//! real provisioner, the SLO gate, and the annotation sink.

mod annotations;
mod client;
mod slo;

pub use annotations::AnnotationSink;
pub use client::{
    GroupPatch, HttpProvisionerClient, ProvisionerApi, ProvisionerGroup, ProvisionerGroupStatus,
};
pub use slo::SloGate;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::model::{InstallationGroup, Ring, RingRelease};

/// Errors from provisioner operations.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// Transport-level failure talking to an external endpoint.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The external endpoint rejected the request.
    #[error("provisioner returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// The provisioner does not know the referenced group.
    #[error("provisioner group {id} not found, make sure it exists")]
    GroupNotFound { id: String },

    /// A group release did not converge before the deadline.
    #[error("timed out waiting for group {id} release to complete")]
    ReleaseTimeout { id: String },

    /// An SLO error budget is burning too fast.
    #[error("SLO service {service} is showing a high API error rate")]
    SloBreach { service: String },

    #[error("{0}")]
    Other(String),
}

/// Tunables for provisioning operations.
#[derive(Debug, Clone)]
pub struct ProvisioningParams {
    /// How long to wait for a provisioner group release to converge.
    pub group_release_timeout: Duration,
    /// How often to poll group status while waiting.
    pub group_poll_interval: Duration,
}

impl Default for ProvisioningParams {
    fn default() -> Self {
        Self {
            group_release_timeout: Duration::from_secs(3600),
            group_poll_interval: Duration::from_secs(60),
        }
    }
}

/// Ring-level provisioning operations consumed by the ring supervisor.
#[async_trait]
pub trait RingProvisioner: Send + Sync {
    /// Prepares a ring for provisioning; returns whether the ring was
    /// modified and should be persisted before creation proceeds.
    fn prepare_ring(&self, ring: &Ring) -> bool;

    async fn create_ring(&self, ring: &Ring) -> Result<(), ProvisionerError>;

    async fn release_ring(&self, ring: &Ring) -> Result<(), ProvisionerError>;

    /// Watches SLOs for the ring's groups during the soak period.
    async fn soak_ring(&self, ring: &Ring) -> Result<(), ProvisionerError>;

    async fn rollback_ring(&self, ring: &Ring) -> Result<(), ProvisionerError>;

    async fn delete_ring(&self, ring: &Ring) -> Result<(), ProvisionerError>;
}

/// Group-level provisioning operations consumed by the installation
/// group supervisor.
#[async_trait]
pub trait GroupProvisioner: Send + Sync {
    /// Patches the backing provisioner group to the release and waits
    /// for its in-flight installations to finish updating.
    async fn release_installation_group(
        &self,
        group: &InstallationGroup,
        release: &RingRelease,
    ) -> Result<(), ProvisionerError>;

    /// Watches SLOs for the group during its soak period.
    async fn soak_installation_group(
        &self,
        group: &InstallationGroup,
    ) -> Result<(), ProvisionerError>;

    /// Posts a best-effort release annotation.
    async fn annotate(
        &self,
        text: &str,
        ring: &Ring,
        group: &InstallationGroup,
        release: &RingRelease,
    );
}

/// The production provisioner: an HTTP client plus the SLO gate and the
/// annotation sink.
pub struct ElrondProvisioner {
    params: ProvisioningParams,
    api: Arc<dyn ProvisionerApi>,
    slo: Option<SloGate>,
    annotations: AnnotationSink,
}

impl ElrondProvisioner {
    #[must_use]
    pub fn new(
        params: ProvisioningParams,
        api: Arc<dyn ProvisionerApi>,
        slo: Option<SloGate>,
        annotations: AnnotationSink,
    ) -> Self {
        Self {
            params,
            api,
            slo,
            annotations,
        }
    }

    async fn check_slos(&self, groups: &[InstallationGroup]) -> Result<(), ProvisionerError> {
        match &self.slo {
            Some(gate) => gate.check_groups(groups).await,
            // No SLO endpoint configured: the gate passes.
            None => Ok(()),
        }
    }

    async fn wait_for_group_release(&self, group_id: &str) -> Result<(), ProvisionerError> {
        let deadline = tokio::time::Instant::now() + self.params.group_release_timeout;

        loop {
            let status = self.api.get_group_status(group_id).await?;
            if status.converged() {
                return Ok(());
            }

            info!(provisioner_group = %group_id, "provisioner group release in progress");
            if tokio::time::Instant::now() + self.params.group_poll_interval > deadline {
                return Err(ProvisionerError::ReleaseTimeout {
                    id: group_id.to_string(),
                });
            }
            tokio::time::sleep(self.params.group_poll_interval).await;
        }
    }
}

#[async_trait]
impl RingProvisioner for ElrondProvisioner {
    fn prepare_ring(&self, _ring: &Ring) -> bool {
        false
    }

    async fn create_ring(&self, ring: &Ring) -> Result<(), ProvisionerError> {
        info!(ring = %ring.id, "creating ring");
        Ok(())
    }

    async fn release_ring(&self, ring: &Ring) -> Result<(), ProvisionerError> {
        info!(ring = %ring.id, "releasing ring");
        Ok(())
    }

    async fn soak_ring(&self, ring: &Ring) -> Result<(), ProvisionerError> {
        self.check_slos(&ring.installation_groups).await
    }

    async fn rollback_ring(&self, ring: &Ring) -> Result<(), ProvisionerError> {
        info!(ring = %ring.id, "rolling back ring");
        Ok(())
    }

    async fn delete_ring(&self, ring: &Ring) -> Result<(), ProvisionerError> {
        info!(ring = %ring.id, "deleting ring");
        Ok(())
    }
}

#[async_trait]
impl GroupProvisioner for ElrondProvisioner {
    async fn release_installation_group(
        &self,
        group: &InstallationGroup,
        release: &RingRelease,
    ) -> Result<(), ProvisionerError> {
        info!(installation_group = %group.id, "releasing installation group");

        let provisioner_group = self.api.get_group(&group.provisioner_group_id).await?;

        // An empty release env adopts the group's current environment.
        let env_variables = if release.env_variables.is_empty() {
            provisioner_group.env_variables.clone()
        } else {
            release.env_variables.clone()
        };

        let differs = provisioner_group.image != release.image
            || provisioner_group.version != release.version
            || provisioner_group.env_variables != env_variables;
        if !differs {
            info!(
                provisioner_group = %group.provisioner_group_id,
                image = %release.image,
                version = %release.version,
                "provisioner group is already up to date"
            );
            return Ok(());
        }

        info!(
            provisioner_group = %group.provisioner_group_id,
            old_image = %provisioner_group.image,
            old_version = %provisioner_group.version,
            image = %release.image,
            version = %release.version,
            "image or group env variable changes detected, patching group"
        );

        self.api
            .patch_group(&GroupPatch {
                id: group.provisioner_group_id.clone(),
                image: release.image.clone(),
                version: release.version.clone(),
                env_variables,
                readiness_probe: release.readiness_probe.clone(),
                liveness_probe: release.liveness_probe.clone(),
            })
            .await?;

        info!(
            provisioner_group = %group.provisioner_group_id,
            timeout_seconds = self.params.group_release_timeout.as_secs(),
            "waiting for the group release to complete"
        );
        self.wait_for_group_release(&group.provisioner_group_id).await
    }

    async fn soak_installation_group(
        &self,
        group: &InstallationGroup,
    ) -> Result<(), ProvisionerError> {
        self.check_slos(std::slice::from_ref(group)).await
    }

    async fn annotate(
        &self,
        text: &str,
        ring: &Ring,
        group: &InstallationGroup,
        release: &RingRelease,
    ) {
        self.annotations.annotate(text, ring, group, release).await;
    }
}
