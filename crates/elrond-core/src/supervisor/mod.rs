//! Reconciliation loops.
//!
//! Two supervisors cooperate to drive rollouts: the ring supervisor
//! advances rings through the release state machine and enforces
//! priority and the global single-release invariant; the installation
//! group supervisor performs the actual provisioner work per group.
//! Multiple server instances may run supervisors against a shared
//! store; coordination happens only through row locks.

mod installation_group;
mod ring;
mod scheduler;

pub use installation_group::InstallationGroupSupervisor;
pub use ring::RingSupervisor;
pub use scheduler::{Doer, Scheduler};

use std::time::Duration;

/// Timing tunables for the supervisors, configuration rather than
/// constants so tests can compress them.
#[derive(Debug, Clone)]
pub struct SupervisorParams {
    /// How long the ring supervisor sleeps between soak checks.
    pub soak_check_sleep: Duration,

    /// How long a release-pending installation group may stay locked
    /// with no legitimate reason before its lock is reclaimed.
    pub stale_lock_threshold: Duration,
}

impl Default for SupervisorParams {
    fn default() -> Self {
        Self {
            soak_check_sleep: Duration::from_secs(30),
            stale_lock_threshold: Duration::from_secs(300),
        }
    }
}
