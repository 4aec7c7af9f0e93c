//! The ring supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::model::{now_ns, InstallationGroupState, Ring, RingState, WebhookEntityType, WebhookPayload};
use crate::provisioner::RingProvisioner;
use crate::store::Store;
use crate::webhook::WebhookSender;

use super::{Doer, SupervisorParams};

/// Finds rings pending work and drives them through the release state
/// machine.
pub struct RingSupervisor {
    store: Arc<Store>,
    provisioner: Arc<dyn RingProvisioner>,
    webhooks: WebhookSender,
    instance_id: String,
    params: SupervisorParams,
}

impl RingSupervisor {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        provisioner: Arc<dyn RingProvisioner>,
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

    /// Schedules the required work on the given ring.
    pub async fn supervise(&self, ring: &Ring) {
        match self.store.lock_ring(&ring.id, &self.instance_id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(ring = %ring.id, error = %err, "failed to lock ring");
                return;
            }
        }

        self.supervise_locked(ring).await;

        if let Err(err) = self.store.unlock_ring(&ring.id, &self.instance_id, false) {
            warn!(ring = %ring.id, error = %err, "failed to unlock ring");
        }
    }

    async fn supervise_locked(&self, ring: &Ring) {
        // The ring may have been advanced by another server between the
        // listing and the lock acquisition; never act on stale state.
        let original_state = ring.state;
        let ring = match self.store.get_ring(&ring.id) {
            Ok(Some(ring)) => ring,
            Ok(None) => {
                warn!(ring = %ring.id, "ring disappeared while locked");
                return;
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get refreshed ring");
                return;
            }
        };
        if ring.state != original_state {
            warn!(
                ring = %ring.id,
                old_state = %original_state,
                new_state = %ring.state,
                "another server has worked on this ring; skipping"
            );
            return;
        }

        debug!(ring = %ring.id, state = %ring.state, "supervising ring");

        let new_state = self.transition_ring(&ring).await;

        let mut ring = match self.store.get_ring(&ring.id) {
            Ok(Some(ring)) => ring,
            Ok(None) => return,
            Err(err) => {
                warn!(ring = %ring.id, error = %err, new_state = %new_state,
                    "failed to get ring to persist state");
                return;
            }
        };
        if ring.state == new_state {
            return;
        }

        let old_state = ring.state;
        ring.state = new_state;
        if old_state == RingState::ReleaseInProgress
            && matches!(new_state, RingState::SoakingRequested | RingState::Stable)
        {
            ring.release_at = now_ns();
        }

        if let Err(err) = self.store.update_ring(&ring) {
            warn!(ring = %ring.id, error = %err, new_state = %new_state,
                "failed to set ring state");
            return;
        }

        // Abort the coordinated rollout as soon as any ring fails.
        if matches!(new_state, RingState::ReleaseFailed | RingState::SoakingFailed) {
            info!(ring = %ring.id, "ring release has failed, moving pending rings to failed state");
            self.fail_pending_rings();
        }

        self.webhooks.send_to_all(
            &self.store,
            &WebhookPayload {
                timestamp: now_ns(),
                id: ring.id.clone(),
                name: ring.name.clone(),
                entity_type: WebhookEntityType::Ring,
                new_state: new_state.to_string(),
                old_state: old_state.to_string(),
                extra_data: Default::default(),
            },
        );

        debug!(ring = %ring.id, old_state = %old_state, new_state = %new_state,
            "transitioned ring");
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

    async fn transition_ring(&self, ring: &Ring) -> RingState {
        match ring.state {
            RingState::CreationRequested => self.create_ring(ring).await,
            RingState::ReleasePending => self.check_release_pending(ring).await,
            RingState::ReleaseRequested => self.release_ring(ring).await,
            RingState::ReleaseInProgress => self.check_release_progress(ring).await,
            RingState::SoakingRequested => self.soak_ring(ring).await,
            RingState::ReleaseRollbackRequested => self.rollback_ring(ring).await,
            RingState::DeletionRequested => self.delete_ring(ring).await,
            state => {
                warn!(ring = %ring.id, state = %state,
                    "found ring pending work in unexpected state");
                state
            }
        }
    }

    async fn create_ring(&self, ring: &Ring) -> RingState {
        if self.provisioner.prepare_ring(ring) {
            if let Err(err) = self.store.update_ring(ring) {
                error!(ring = %ring.id, error = %err,
                    "failed to record updated ring after preparation");
                return RingState::CreationFailed;
            }
        }

        if let Err(err) = self.provisioner.create_ring(ring).await {
            error!(ring = %ring.id, error = %err, "failed to create ring");
            return RingState::CreationFailed;
        }

        info!(ring = %ring.id, "finished creating ring");
        RingState::Stable
    }

    /// Admission: a pending release proceeds only when no other ring
    /// holds the release slot and no unlocked pending ring outranks this
    /// one. A forced release skips both gates.
    async fn check_release_pending(&self, ring: &Ring) -> RingState {
        debug!(ring = %ring.id, "checking if pending ring release can proceed");

        let release = match self.store.get_ring_release(&ring.desired_release_id) {
            Ok(Some(release)) => release,
            Ok(None) => {
                error!(ring = %ring.id, release = %ring.desired_release_id,
                    "desired release does not exist");
                return RingState::ReleaseFailed;
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get the desired ring release");
                return RingState::ReleaseFailed;
            }
        };

        if !release.force {
            let rings_locked = match self.store.get_rings_locked() {
                Ok(rings) => rings,
                Err(err) => {
                    error!(error = %err, "failed to query for rings under lock");
                    return RingState::ReleaseFailed;
                }
            };
            let rings_in_progress = match self.store.get_rings_release_in_progress() {
                Ok(rings) => rings,
                Err(err) => {
                    error!(error = %err, "failed to query for rings under release");
                    return RingState::ReleaseFailed;
                }
            };

            // The supervisor holds this ring's own lock, so one locked
            // ring is expected.
            if rings_locked.len() > 1 || !rings_in_progress.is_empty() {
                debug!(ring = %ring.id, "another ring is under lock and being updated");
                return RingState::ReleasePending;
            }

            debug!(ring = %ring.id, "checking ring prioritization");
            let unlocked_pending = match self.store.get_unlocked_rings_pending_work() {
                Ok(rings) => rings,
                Err(err) => {
                    error!(error = %err, "failed to get rings pending work for prioritization");
                    return RingState::ReleaseFailed;
                }
            };
            for other in &unlocked_pending {
                if other.priority < ring.priority {
                    debug!(ring = %ring.id, prioritized_ring = %other.id,
                        "yielding to higher-priority ring");
                    return RingState::ReleasePending;
                }
            }
        }

        let groups = match self.store.get_installation_groups_for_ring(&ring.id) {
            Ok(groups) => groups,
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get installation groups for ring");
                return RingState::ReleaseFailed;
            }
        };

        for mut group in groups {
            let new_group_state = InstallationGroupState::ReleasePending;
            if !group.valid_transition_to(new_group_state) {
                warn!(
                    installation_group = %group.id,
                    state = %group.state,
                    "unable to change installation group state"
                );
                return RingState::ReleaseFailed;
            }

            info!(installation_group = %group.name, new_state = %new_group_state,
                "setting installation group state");
            group.state = new_group_state;
            if let Err(err) = self.store.update_installation_group(&group) {
                error!(installation_group = %group.id, error = %err,
                    "failed to update installation group");
                return RingState::ReleaseFailed;
            }
        }

        RingState::ReleaseRequested
    }

    async fn release_ring(&self, ring: &Ring) -> RingState {
        if let Err(err) = self.provisioner.release_ring(ring).await {
            error!(ring = %ring.id, error = %err, "failed to release ring");
            return RingState::ReleaseFailed;
        }

        match self.store.get_ring_installation_groups_pending_work(&ring.id) {
            Ok(groups) if !groups.is_empty() => {
                info!(ring = %ring.id, "there are installation groups pending work");
                RingState::ReleaseInProgress
            }
            Ok(_) => {
                info!(ring = %ring.id, "finished releasing ring");
                RingState::SoakingRequested
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err,
                    "failed to get ring installation groups pending work");
                RingState::ReleaseFailed
            }
        }
    }

    async fn check_release_progress(&self, ring: &Ring) -> RingState {
        match self.store.get_ring_installation_groups_pending_work(&ring.id) {
            Ok(groups) if !groups.is_empty() => {
                info!(ring = %ring.id, "there are installation groups pending work");
                return RingState::ReleaseInProgress;
            }
            Ok(_) => {}
            Err(err) => {
                error!(ring = %ring.id, error = %err,
                    "failed to get ring installation groups pending work");
                return RingState::ReleaseFailed;
            }
        }

        info!(ring = %ring.id, "finished releasing ring");

        let release = match self.store.get_ring_release(&ring.desired_release_id) {
            Ok(Some(release)) => release,
            Ok(None) => {
                error!(ring = %ring.id, release = %ring.desired_release_id,
                    "desired release does not exist");
                return RingState::ReleaseFailed;
            }
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get the desired ring release");
                return RingState::ReleaseFailed;
            }
        };

        if release.force {
            info!(ring = %ring.id,
                "forced release, skipping ring soak and promoting active release");

            let mut ring = ring.clone();
            ring.active_release_id = ring.desired_release_id.clone();
            if let Err(err) = self.store.update_ring(&ring) {
                error!(ring = %ring.id, error = %err, "failed to record promoted release");
                return RingState::ReleaseFailed;
            }
            return RingState::Stable;
        }

        RingState::SoakingRequested
    }

    async fn soak_ring(&self, ring: &Ring) -> RingState {
        let mut ring = ring.clone();
        ring.installation_groups = match self.store.get_installation_groups_for_ring(&ring.id) {
            Ok(groups) => groups,
            Err(err) => {
                error!(ring = %ring.id, error = %err, "failed to get installation groups for ring");
                return RingState::SoakingFailed;
            }
        };

        let elapsed_seconds = (now_ns() - ring.release_at) / 1_000_000_000;
        if elapsed_seconds < ring.soak_time {
            info!(
                ring = %ring.id,
                remaining_seconds = ring.soak_time - elapsed_seconds,
                "ring is still soaking"
            );
            if let Err(err) = self.provisioner.soak_ring(&ring).await {
                error!(ring = %ring.id, error = %err, "failed to soak ring");
                return RingState::SoakingFailed;
            }
            tokio::time::sleep(self.params.soak_check_sleep).await;
            return RingState::SoakingRequested;
        }

        info!(ring = %ring.id, "finished soaking ring, promoting active release");

        ring.active_release_id = ring.desired_release_id.clone();
        if let Err(err) = self.store.update_ring(&ring) {
            error!(ring = %ring.id, error = %err, "failed to record promoted release");
            return RingState::SoakingFailed;
        }
        RingState::Stable
    }

    async fn rollback_ring(&self, ring: &Ring) -> RingState {
        if let Err(err) = self.provisioner.rollback_ring(ring).await {
            error!(ring = %ring.id, error = %err, "failed to roll back ring");
            return RingState::ReleaseRollbackFailed;
        }

        info!(ring = %ring.id, "finished rolling back ring");
        RingState::ReleaseRollbackComplete
    }

    async fn delete_ring(&self, ring: &Ring) -> RingState {
        if let Err(err) = self.provisioner.delete_ring(ring).await {
            error!(ring = %ring.id, error = %err, "failed to delete ring");
            return RingState::DeletionFailed;
        }

        if let Err(err) = self.store.delete_ring(&ring.id) {
            error!(ring = %ring.id, error = %err, "failed to record ring deletion");
            return RingState::DeletionFailed;
        }

        info!(ring = %ring.id, "finished deleting ring");
        RingState::Deleted
    }
}

#[async_trait]
impl Doer for RingSupervisor {
    fn name(&self) -> &'static str {
        "ring"
    }

    async fn do_work(&self) {
        let rings = match self.store.get_unlocked_rings_pending_work() {
            Ok(rings) => rings,
            Err(err) => {
                warn!(error = %err, "failed to query for rings pending work");
                return;
            }
        };

        for ring in rings {
            self.supervise(&ring).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstallationGroup, RingRelease};
    use crate::provisioner::ProvisionerError;
    use std::collections::BTreeMap;

    struct OkProvisioner;

    #[async_trait]
    impl RingProvisioner for OkProvisioner {
        fn prepare_ring(&self, _ring: &Ring) -> bool {
            false
        }

        async fn create_ring(&self, _ring: &Ring) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn release_ring(&self, _ring: &Ring) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn soak_ring(&self, _ring: &Ring) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn rollback_ring(&self, _ring: &Ring) -> Result<(), ProvisionerError> {
            Ok(())
        }

        async fn delete_ring(&self, _ring: &Ring) -> Result<(), ProvisionerError> {
            Ok(())
        }
    }

    fn supervisor(store: &Arc<Store>) -> RingSupervisor {
        RingSupervisor::new(
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

    fn seed_pending_ring(store: &Store, name: &str, priority: i64, force: bool) -> Ring {
        let release = store
            .get_or_create_ring_release(&RingRelease {
                id: String::new(),
                image: "app".to_string(),
                version: "1.0".to_string(),
                force,
                env_variables: BTreeMap::new(),
                readiness_probe: None,
                liveness_probe: None,
                create_at: 0,
            })
            .unwrap();

        let mut ring = Ring {
            id: String::new(),
            name: name.to_string(),
            priority,
            soak_time: 0,
            state: RingState::ReleasePending,
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
            state: crate::model::InstallationGroupState::Stable,
            release_at: 0,
            soak_time: 0,
            provisioner_group_id: format!("pg-{name}"),
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        store.create_ring(&mut ring, Some(&mut group)).unwrap();
        // Create assigns state from the struct as-is; re-read for the
        // stored row.
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.get_ring(&ring.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn admission_yields_to_a_higher_priority_pending_ring() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let urgent = seed_pending_ring(&store, "urgent", 1, false);
        let routine = seed_pending_ring(&store, "routine", 5, false);

        // Admission runs under the ring's own lock.
        assert!(store.lock_ring(&routine.id, "test-instance").unwrap());
        let new_state = supervisor.check_release_pending(&routine).await;
        assert_eq!(new_state, RingState::ReleasePending);
        store.unlock_ring(&routine.id, "test-instance", false).unwrap();

        // The urgent ring sees no one outranking it and proceeds.
        assert!(store.lock_ring(&urgent.id, "test-instance").unwrap());
        let new_state = supervisor.check_release_pending(&urgent).await;
        assert_eq!(new_state, RingState::ReleaseRequested);
    }

    #[tokio::test]
    async fn admission_waits_while_another_release_is_in_progress() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let mut busy = seed_pending_ring(&store, "busy", 1, false);
        busy.state = RingState::ReleaseInProgress;
        store.update_ring(&busy).unwrap();

        let waiting = seed_pending_ring(&store, "waiting", 1, false);
        assert!(store.lock_ring(&waiting.id, "test-instance").unwrap());
        let new_state = supervisor.check_release_pending(&waiting).await;
        assert_eq!(new_state, RingState::ReleasePending);
    }

    #[tokio::test]
    async fn forced_release_bypasses_admission_gates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let mut busy = seed_pending_ring(&store, "busy", 1, false);
        busy.state = RingState::ReleaseInProgress;
        store.update_ring(&busy).unwrap();

        // Forced, lower priority, and another release in flight: still
        // admitted.
        let forced = seed_pending_ring(&store, "forced", 9, true);
        assert!(store.lock_ring(&forced.id, "test-instance").unwrap());
        let new_state = supervisor.check_release_pending(&forced).await;
        assert_eq!(new_state, RingState::ReleaseRequested);
    }

    #[tokio::test]
    async fn admission_fails_when_a_group_cannot_transition() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = supervisor(&store);

        let ring = seed_pending_ring(&store, "ring-0", 1, false);
        let mut group = store.get_installation_groups_for_ring(&ring.id).unwrap()[0].clone();
        group.state = crate::model::InstallationGroupState::ReleaseSoakingRequested;
        store.update_installation_group(&group).unwrap();

        assert!(store.lock_ring(&ring.id, "test-instance").unwrap());
        let new_state = supervisor.check_release_pending(&ring).await;
        assert_eq!(new_state, RingState::ReleaseFailed);
    }
}
