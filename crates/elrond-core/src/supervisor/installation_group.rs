//! The installation group supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::model::{
    now_ns, InstallationGroup, InstallationGroupState, RingState, WebhookEntityType,
    WebhookPayload,
};
use crate::provisioner::GroupProvisioner;
use crate::store::Store;
use crate::webhook::WebhookSender;

use super::{Doer, SupervisorParams};

/// Finds installation groups pending work, performs the provisioner
/// release for each, and gates completion on soak and SLOs.
pub struct InstallationGroupSupervisor {
    store: Arc<Store>,
    provisioner: Arc<dyn GroupProvisioner>,
    webhooks: WebhookSender,
    instance_id: String,
    params: SupervisorParams,
}

impl InstallationGroupSupervisor {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        provisioner: Arc<dyn GroupProvisioner>,
        webhooks: WebhookSender,
        instance_id: String,
        params: SupervisorParams,
    ) -> Self {
        Self {
            store,
            provisioner,
            webhooks,
            instance_id,
            params,
        }
    }

    /// Schedules the required work on the given installation group.
    pub async fn supervise(&self, group: &InstallationGroup) {
        match self.store.lock_installation_group(&group.id, &self.instance_id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(installation_group = %group.id, error = %err,
                    "failed to lock installation group");
                return;
            }
        }

        self.supervise_locked(group).await;

        if let Err(err) = self
            .store
            .unlock_installation_group(&group.id, &self.instance_id, false)
        {
            warn!(installation_group = %group.id, error = %err,
                "failed to unlock installation group");
        }
    }

    async fn supervise_locked(&self, group: &InstallationGroup) {
        let original_state = group.state;
        let group = match self.store.get_installation_group_by_id(&group.id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                warn!(installation_group = %group.id, "installation group disappeared while locked");
                return;
            }
            Err(err) => {
                error!(installation_group = %group.id, error = %err,
                    "failed to get refreshed installation group");
                return;
            }
        };
        if group.state != original_state {
            warn!(
                installation_group = %group.id,
                old_state = %original_state,
                new_state = %group.state,
                "another server has worked on this installation group; skipping"
            );
            return;
        }

        debug!(installation_group = %group.id, state = %group.state,
            "supervising installation group");

        let new_state = self.transition_group(&group).await;

        let mut group = match self.store.get_installation_group_by_id(&group.id) {
            Ok(Some(group)) => group,
            Ok(None) => return,
            Err(err) => {
                warn!(installation_group = %group.id, error = %err, new_state = %new_state,
                    "failed to get installation group to persist state");
                return;
            }
        };
        if group.state == new_state {
            return;
        }

        let old_state = group.state;
        group.state = new_state;
        if old_state == InstallationGroupState::ReleaseRequested
            && matches!(
                new_state,
                InstallationGroupState::ReleaseSoakingRequested | InstallationGroupState::Stable
            )
        {
            group.release_at = now_ns();
        }

        if let Err(err) = self.store.update_installation_group(&group) {
            warn!(installation_group = %group.id, error = %err, new_state = %new_state,
                "failed to set installation group state");
            return;
        }

        // Abort the coordinated rollout as soon as any group fails.
        if matches!(
            new_state,
            InstallationGroupState::ReleaseFailed | InstallationGroupState::SoakingFailed
        ) {
            info!(installation_group = %group.id,
                "installation group release has failed, moving pending rings to failed state");
            self.fail_pending_rings();
        }

        self.webhooks.send_to_all(
            &self.store,
            &WebhookPayload {
                timestamp: now_ns(),
                id: group.id.clone(),
                name: group.name.clone(),
                entity_type: WebhookEntityType::InstallationGroup,
                new_state: new_state.to_string(),
                old_state: old_state.to_string(),
                extra_data: Default::default(),
            },
        );

        debug!(
            installation_group = %group.id,
            old_state = %old_state,
            new_state = %new_state,
            "transitioned installation group"
        );
    }

    fn fail_pending_rings(&self) {
        let mut rings = match self.store.get_rings_pending_work() {
            Ok(rings) => rings,
            Err(err) => {
                error!(error = %err, "failed to get all rings pending work");
                return;
            }
        };
        for ring in &mut rings {
            ring.state = RingState::ReleaseFailed;
        }
        if let Err(err) = self.store.update_rings(&rings) {
            error!(error = %err, "failed to move rings to failed state");
        }
    }

    async fn transition_group(&self, group: &InstallationGroup) -> InstallationGroupState {
        match group.state {
            InstallationGroupState::ReleasePending => self.check_group_pending(group).await,
            InstallationGroupState::ReleaseRequested => self.release_group(group).await,
            InstallationGroupState::ReleaseSoakingRequested => self.soak_group(group).await,
            state => {
                warn!(installation_group = %group.id, state = %state,
                    "found installation group pending work in unexpected state");
                state
            }
        }
    }

    /// A pending group advances only once its ring has been admitted and
    /// no sibling group is currently releasing.
    async fn check_group_pending(&self, group: &InstallationGroup) -> InstallationGroupState {
        debug!(installation_group = %group.id, "checking whether the owning ring allows release");

        let ring = match self.store.get_ring_from_installation_group_id(&group.id) {
            Ok(ring) => ring,
            Err(err) => {
                error!(installation_group = %group.id, error = %err,
                    "failed to query for the ring of the installation group");
                return InstallationGroupState::ReleaseFailed;
            }
        };

        if ring.state == RingState::ReleaseFailed {
            return InstallationGroupState::ReleaseFailed;
        }
        if ring.state != RingState::ReleaseRequested && ring.state != RingState::ReleaseInProgress
        {
            return InstallationGroupState::ReleasePending;
        }

        debug!(installation_group = %group.id, "checking if other installation groups are locked");

        let groups_locked = match self.store.get_installation_groups_locked() {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "failed to query for installation groups under lock");
                return InstallationGroupState::ReleaseFailed;
            }
        };
        let groups_in_progress = match self.store.get_installation_groups_release_in_progress() {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "failed to query for installation groups under release");
                return InstallationGroupState::ReleaseFailed;
            }
        };

        // The supervisor holds this group's own lock, so one locked
        // group is expected.
        if groups_locked.len() > 1 || !groups_in_progress.is_empty() {
            debug!(installation_group = %group.id,
                "another installation group is under lock and being updated");
            return InstallationGroupState::ReleasePending;
        }

        InstallationGroupState::ReleaseRequested
    }

    async fn release_group(&self, group: &InstallationGroup) -> InstallationGroupState {
        let ring = match self.store.get_ring_from_installation_group_id(&group.id) {
            Ok(ring) => ring,
            Err(err) => {
                error!(installation_group = %group.id, error = %err,
                    "failed to get the ring of the installation group");
                return InstallationGroupState::ReleaseFailed;
            }
        };
        let release = match self.store.get_ring_release(&ring.desired_release_id) {
            Ok(Some(release)) => release,
            Ok(None) => {
                error!(ring = %ring.id, release = %ring.desired_release_id,
                    "desired release does not exist");
                return InstallationGroupState::ReleaseFailed;
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get the desired ring release");
                return InstallationGroupState::ReleaseFailed;
            }
        };

        self.provisioner
            .annotate(
                &format!(
                    "Initiating release for ring {} and installation group {}",
                    ring.name, group.provisioner_group_id
                ),
                &ring,
                group,
                &release,
            )
            .await;

        if let Err(err) = self
            .provisioner
            .release_installation_group(group, &release)
            .await
        {
            error!(installation_group = %group.id, error = %err,
                "failed to release installation group");
            return InstallationGroupState::ReleaseFailed;
        }
        info!(installation_group = %group.id, "finished releasing installation group");

        if release.force {
            info!(installation_group = %group.id,
                "forced release, skipping installation group soak");
            self.provisioner
                .annotate(
                    &format!(
                        "Release for ring {} and installation group {} is complete",
                        ring.name, group.provisioner_group_id
                    ),
                    &ring,
                    group,
                    &release,
                )
                .await;
            return InstallationGroupState::Stable;
        }
        InstallationGroupState::ReleaseSoakingRequested
    }

    async fn soak_group(&self, group: &InstallationGroup) -> InstallationGroupState {
        let elapsed_seconds = (now_ns() - group.release_at) / 1_000_000_000;
        if elapsed_seconds < group.soak_time {
            info!(
                installation_group = %group.id,
                remaining_seconds = group.soak_time - elapsed_seconds,
                "installation group is still soaking"
            );
            return InstallationGroupState::ReleaseSoakingRequested;
        }

        if let Err(err) = self.provisioner.soak_installation_group(group).await {
            error!(installation_group = %group.id, error = %err,
                "failed to soak installation group");
            return InstallationGroupState::SoakingFailed;
        }

        info!(installation_group = %group.id, "finished soaking installation group");

        let ring = match self.store.get_ring_from_installation_group_id(&group.id) {
            Ok(ring) => ring,
            Err(err) => {
                error!(installation_group = %group.id, error = %err,
                    "failed to get the ring of the installation group");
                return InstallationGroupState::ReleaseFailed;
            }
        };
        let release = match self.store.get_ring_release(&ring.desired_release_id) {
            Ok(Some(release)) => release,
            Ok(None) => {
                error!(ring = %ring.id, release = %ring.desired_release_id,
                    "desired release does not exist");
                return InstallationGroupState::ReleaseFailed;
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get the desired ring release");
                return InstallationGroupState::ReleaseFailed;
            }
        };

        self.provisioner
            .annotate(
                &format!(
                    "Release for ring {} and installation group {} is complete",
                    ring.name, group.provisioner_group_id
                ),
                &ring,
                group,
                &release,
            )
            .await;

        InstallationGroupState::Stable
    }

    /// Reclaims locks on release-pending groups that have no legitimate
    /// reason to wait and whose lock has outlived the stale threshold.
    /// Owner identity is ignored: the holder is presumed dead.
    fn reclaim_stale_locks(&self) {
        let locked_groups = match self.store.get_installation_groups_locked() {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "failed to get locked installation groups for lock cleanup");
                return;
            }
        };
        if locked_groups.is_empty() {
            return;
        }

        for group in &locked_groups {
            if group.state != InstallationGroupState::ReleasePending {
                continue;
            }

            match self.has_legitimate_wait(group) {
                Ok(true) => {
                    debug!(installation_group = %group.id,
                        "group is legitimately pending, not stuck");
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(installation_group = %group.id, error = %err,
                        "failed to check if group is legitimately pending");
                    continue;
                }
            }

            let lock_age_ns = now_ns() - group.lock_acquired_at;
            if lock_age_ns <= self.params.stale_lock_threshold.as_nanos() as i64 {
                continue;
            }

            let lock_acquired_by = group.lock_acquired_by.clone().unwrap_or_default();
            warn!(
                installation_group = %group.id,
                name = %group.name,
                lock_acquired_by = %lock_acquired_by,
                "release-pending installation group locked with no legitimate reason, force unlocking"
            );

            match self
                .store
                .unlock_installation_group(&group.id, &lock_acquired_by, true)
            {
                Ok(true) => {
                    info!(installation_group = %group.id,
                        "force unlocked stuck release-pending installation group");
                }
                Ok(false) => {}
                Err(err) => {
                    error!(installation_group = %group.id, error = %err,
                        "failed to force unlock installation group");
                }
            }
        }
    }

    /// A pending group is waiting legitimately when another group is in
    /// progress or another group holds a lock.
    fn has_legitimate_wait(&self, group: &InstallationGroup) -> Result<bool, crate::store::StoreError> {
        let in_progress = self.store.get_installation_groups_release_in_progress()?;
        if !in_progress.is_empty() {
            debug!(
                installation_group = %group.id,
                waiting_for = %in_progress[0].id,
                "group is waiting for another group in progress"
            );
            return Ok(true);
        }

        let locked = self.store.get_installation_groups_locked()?;
        for other in &locked {
            if other.id != group.id {
                debug!(
                    installation_group = %group.id,
                    waiting_for = %other.id,
                    "group is waiting for another locked group"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[async_trait]
impl Doer for InstallationGroupSupervisor {
    fn name(&self) -> &'static str {
        "installation-group"
    }

    async fn do_work(&self) {
        let groups = match self.store.get_installation_groups_pending_work() {
            Ok(groups) => groups,
            Err(err) => {
                warn!(error = %err, "failed to query for installation groups pending work");
                return;
            }
        };

        debug!(pending_count = groups.len(), "starting installation group supervision cycle");

        // Clean up locks abandoned by dead instances before taking on
        // new work.
        self.reclaim_stale_locks();

        for group in groups {
            self.supervise(&group).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ring, RingRelease};
    use crate::provisioner::{GroupProvisioner, ProvisionerError};
    use std::collections::BTreeMap;

    struct OkProvisioner;

    #[async_trait]
    impl GroupProvisioner for OkProvisioner {
        async fn release_installation_group(
            &self,
            _group: &InstallationGroup,
            _release: &RingRelease,
        ) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn soak_installation_group(
            &self,
            _group: &InstallationGroup,
        ) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn annotate(
            &self,
            _text: &str,
            _ring: &Ring,
            _group: &InstallationGroup,
            _release: &RingRelease,
        ) {
        }
    }

    fn supervisor(store: &Arc<Store>) -> InstallationGroupSupervisor {
        InstallationGroupSupervisor::new(
            Arc::clone(store),
            Arc::new(OkProvisioner),
            crate::webhook::WebhookSender::new(),
            "test-instance".to_string(),
            super::super::SupervisorParams {
                soak_check_sleep: std::time::Duration::ZERO,
                stale_lock_threshold: std::time::Duration::ZERO,
            },
        )
    }

    fn seed_ring_with_pending_group(
        store: &Store,
        name: &str,
        ring_state: RingState,
    ) -> (Ring, InstallationGroup) {
        let release = store
            .get_or_create_ring_release(&RingRelease {
                id: String::new(),
                image: "app".to_string(),
                version: "1.0".to_string(),
                force: false,
                env_variables: BTreeMap::new(),
                readiness_probe: None,
                liveness_probe: None,
                create_at: 0,
            })
            .unwrap();

        let mut ring = Ring {
            id: String::new(),
            name: name.to_string(),
            priority: 1,
            soak_time: 0,
            state: ring_state,
            provisioner: crate::model::PROVISIONER_NAME.to_string(),
            active_release_id: String::new(),
            desired_release_id: release.id,
            create_at: 0,
            delete_at: 0,
            release_at: 0,
            api_security_lock: false,
            lock_acquired_by: None,
            lock_acquired_at: 0,
            installation_groups: Vec::new(),
        };
        let mut group = InstallationGroup {
            id: String::new(),
            name: format!("{name}-group"),
            state: InstallationGroupState::ReleasePending,
            release_at: 0,
            soak_time: 0,
            provisioner_group_id: format!("pg-{name}"),
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_ring(&mut ring, Some(&mut group)).unwrap();
        (ring, group)
    }

    #[tokio::test]
    async fn pending_group_waits_for_ring_admission() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let (_ring, group) =
            seed_ring_with_pending_group(&store, "ring-0", RingState::ReleasePending);

        assert!(store.lock_installation_group(&group.id, "test-instance").unwrap());
        let new_state = supervisor.check_group_pending(&group).await;
        assert_eq!(new_state, InstallationGroupState::ReleasePending);
    }

    #[tokio::test]
    async fn pending_group_propagates_ring_failure() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let (_ring, group) =
            seed_ring_with_pending_group(&store, "ring-0", RingState::ReleaseFailed);

        let new_state = supervisor.check_group_pending(&group).await;
        assert_eq!(new_state, InstallationGroupState::ReleaseFailed);
    }

    #[tokio::test]
    async fn pending_group_advances_once_ring_is_admitted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let (_ring, group) =
            seed_ring_with_pending_group(&store, "ring-0", RingState::ReleaseRequested);

        assert!(store.lock_installation_group(&group.id, "test-instance").unwrap());
        let new_state = supervisor.check_group_pending(&group).await;
        assert_eq!(new_state, InstallationGroupState::ReleaseRequested);
    }

    #[tokio::test]
    async fn pending_group_waits_for_a_sibling_in_progress() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let (ring, group) =
            seed_ring_with_pending_group(&store, "ring-0", RingState::ReleaseInProgress);

        let mut sibling = store
            .create_ring_installation_group(
                &ring.id,
                &InstallationGroup {
                    id: String::new(),
                    name: "sibling".to_string(),
                    state: InstallationGroupState::Stable,
                    release_at: 0,
                    soak_time: 0,
                    provisioner_group_id: "pg-sibling".to_string(),
                    lock_acquired_by: None,
                    lock_acquired_at: 0,
                },
            )
            .unwrap();
        sibling.state = InstallationGroupState::ReleaseRequested;
        store.update_installation_group(&sibling).unwrap();

        assert!(store.lock_installation_group(&group.id, "test-instance").unwrap());
        let new_state = supervisor.check_group_pending(&group).await;
        assert_eq!(new_state, InstallationGroupState::ReleasePending);
    }
}
