//! Ring state machine.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// The state of a ring in its release lifecycle.
///
/// API requests may only move a ring along the transitions permitted by
/// [`RingState::valid_transition_to`]; supervisors additionally record
/// failure states (`creation-failed`, `release-failed`, `soaking-failed`)
/// directly when an operation goes wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RingState {
    /// Undergoing no changes.
    Stable,
    /// In the process of being created.
    CreationRequested,
    /// Creation failed; may be retried.
    CreationFailed,
    /// A release has been submitted and awaits admission.
    ReleasePending,
    /// A pending release has been paused by the operator.
    ReleasePaused,
    /// Admission passed; installation groups are being prepared.
    ReleaseRequested,
    /// Installation groups are rolling out.
    ReleaseInProgress,
    /// The release failed; may be retried or rolled back.
    ReleaseFailed,
    /// Waiting out the soak period while SLOs are watched.
    SoakingRequested,
    /// The soak period detected an SLO breach.
    SoakingFailed,
    /// A rollback has been requested.
    ReleaseRollbackRequested,
    /// The rollback completed.
    ReleaseRollbackComplete,
    /// The rollback failed.
    ReleaseRollbackFailed,
    /// Deletion has been requested.
    DeletionRequested,
    /// Deletion failed; may be retried.
    DeletionFailed,
    /// The ring has been deleted.
    Deleted,
}

impl RingState {
    /// All states the ring supervisor acts on during a work cycle.
    pub const PENDING_WORK: &'static [RingState] = &[
        RingState::CreationRequested,
        RingState::ReleasePending,
        RingState::ReleaseRequested,
        RingState::ReleaseInProgress,
        RingState::SoakingRequested,
        RingState::ReleaseRollbackRequested,
        RingState::DeletionRequested,
    ];

    /// States that are part of a release currently in progress. At most
    /// one ring may be in any of these states unless the desired release
    /// is forced.
    pub const RELEASE_IN_PROGRESS: &'static [RingState] = &[
        RingState::ReleaseRequested,
        RingState::ReleaseInProgress,
        RingState::SoakingRequested,
        RingState::ReleaseRollbackRequested,
    ];

    /// States that are part of a release not yet admitted. Pause, resume,
    /// and cancel operate on rings in these states.
    pub const RELEASE_PENDING: &'static [RingState] =
        &[RingState::ReleasePending, RingState::ReleasePaused];

    /// Stable string form, as persisted and serialized.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::CreationRequested => "creation-requested",
            Self::CreationFailed => "creation-failed",
            Self::ReleasePending => "release-pending",
            Self::ReleasePaused => "release-paused",
            Self::ReleaseRequested => "release-requested",
            Self::ReleaseInProgress => "release-in-progress",
            Self::ReleaseFailed => "release-failed",
            Self::SoakingRequested => "soaking-requested",
            Self::SoakingFailed => "soaking-failed",
            Self::ReleaseRollbackRequested => "release-rollback-requested",
            Self::ReleaseRollbackComplete => "release-rollback-complete",
            Self::ReleaseRollbackFailed => "release-rollback-failed",
            Self::DeletionRequested => "deletion-requested",
            Self::DeletionFailed => "deletion-failed",
            Self::Deleted => "deleted",
        }
    }

    /// Returns whether a ring in this state may be transitioned to
    /// `new_state`.
    #[must_use]
    pub fn valid_transition_to(&self, new_state: RingState) -> bool {
        use RingState as S;

        match self {
            S::Stable => matches!(new_state, S::ReleasePending | S::DeletionRequested),
            S::CreationRequested | S::CreationFailed => {
                matches!(new_state, S::CreationRequested | S::DeletionRequested)
            }
            // A pending ring accepts a re-submitted release.
            S::ReleasePending => matches!(
                new_state,
                S::ReleasePending | S::ReleasePaused | S::ReleaseRequested
            ),
            S::ReleasePaused => matches!(new_state, S::ReleasePending),
            S::ReleaseRequested => matches!(new_state, S::ReleaseInProgress),
            S::ReleaseInProgress => matches!(new_state, S::SoakingRequested | S::Stable),
            S::SoakingRequested => matches!(new_state, S::Stable),
            S::SoakingFailed => matches!(
                new_state,
                S::ReleasePending | S::ReleaseRequested | S::ReleaseRollbackRequested
            ),
            S::ReleaseFailed => matches!(
                new_state,
                S::ReleasePending
                    | S::ReleaseRequested
                    | S::ReleaseRollbackRequested
                    | S::DeletionRequested
            ),
            S::ReleaseRollbackRequested => matches!(
                new_state,
                S::ReleaseRollbackComplete | S::ReleaseRollbackFailed
            ),
            S::ReleaseRollbackComplete => false,
            S::ReleaseRollbackFailed => matches!(new_state, S::ReleaseRollbackRequested),
            S::DeletionRequested => matches!(new_state, S::Deleted | S::DeletionFailed),
            S::DeletionFailed => matches!(new_state, S::DeletionRequested),
            S::Deleted => false,
        }
    }
}

impl fmt::Display for RingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "creation-requested" => Ok(Self::CreationRequested),
            "creation-failed" => Ok(Self::CreationFailed),
            "release-pending" => Ok(Self::ReleasePending),
            "release-paused" => Ok(Self::ReleasePaused),
            "release-requested" => Ok(Self::ReleaseRequested),
            "release-in-progress" => Ok(Self::ReleaseInProgress),
            "release-failed" => Ok(Self::ReleaseFailed),
            "soaking-requested" => Ok(Self::SoakingRequested),
            "soaking-failed" => Ok(Self::SoakingFailed),
            "release-rollback-requested" => Ok(Self::ReleaseRollbackRequested),
            "release-rollback-complete" => Ok(Self::ReleaseRollbackComplete),
            "release-rollback-failed" => Ok(Self::ReleaseRollbackFailed),
            "deletion-requested" => Ok(Self::DeletionRequested),
            "deletion-failed" => Ok(Self::DeletionFailed),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown ring state {other:?}")),
        }
    }
}

impl ToSql for RingState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for RingState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[RingState] = &[
        RingState::Stable,
        RingState::CreationRequested,
        RingState::CreationFailed,
        RingState::ReleasePending,
        RingState::ReleasePaused,
        RingState::ReleaseRequested,
        RingState::ReleaseInProgress,
        RingState::ReleaseFailed,
        RingState::SoakingRequested,
        RingState::SoakingFailed,
        RingState::ReleaseRollbackRequested,
        RingState::ReleaseRollbackComplete,
        RingState::ReleaseRollbackFailed,
        RingState::DeletionRequested,
        RingState::DeletionFailed,
        RingState::Deleted,
    ];

    #[test]
    fn string_round_trip() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<RingState>().unwrap(), *state);
        }
    }

    #[test]
    fn transition_table() {
        use RingState as S;

        // Every (from, to) pair the transition table allows; all other
        // pairs must be rejected.
        let allowed: &[(S, S)] = &[
            (S::Stable, S::ReleasePending),
            (S::Stable, S::DeletionRequested),
            (S::CreationRequested, S::CreationRequested),
            (S::CreationRequested, S::DeletionRequested),
            (S::CreationFailed, S::CreationRequested),
            (S::CreationFailed, S::DeletionRequested),
            (S::ReleasePending, S::ReleasePending),
            (S::ReleasePending, S::ReleasePaused),
            (S::ReleasePending, S::ReleaseRequested),
            (S::ReleasePaused, S::ReleasePending),
            (S::ReleaseRequested, S::ReleaseInProgress),
            (S::ReleaseInProgress, S::SoakingRequested),
            (S::ReleaseInProgress, S::Stable),
            (S::SoakingRequested, S::Stable),
            (S::SoakingFailed, S::ReleasePending),
            (S::SoakingFailed, S::ReleaseRequested),
            (S::SoakingFailed, S::ReleaseRollbackRequested),
            (S::ReleaseFailed, S::ReleasePending),
            (S::ReleaseFailed, S::ReleaseRequested),
            (S::ReleaseFailed, S::ReleaseRollbackRequested),
            (S::ReleaseFailed, S::DeletionRequested),
            (S::ReleaseRollbackRequested, S::ReleaseRollbackComplete),
            (S::ReleaseRollbackRequested, S::ReleaseRollbackFailed),
            (S::ReleaseRollbackFailed, S::ReleaseRollbackRequested),
            (S::DeletionRequested, S::Deleted),
            (S::DeletionRequested, S::DeletionFailed),
            (S::DeletionFailed, S::DeletionRequested),
        ];

        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(*from, *to));
                assert_eq!(
                    from.valid_transition_to(*to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&RingState::ReleaseInProgress).unwrap();
        assert_eq!(json, "\"release-in-progress\"");
        let state: RingState = serde_json::from_str("\"soaking-requested\"").unwrap();
        assert_eq!(state, RingState::SoakingRequested);
    }
}
