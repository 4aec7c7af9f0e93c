//! Installation group state machine.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// The state of an installation group within a ring rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationGroupState {
    /// Undergoing no changes.
    Stable,
    /// Waiting for its turn in the ring rollout.
    ReleasePending,
    /// The provisioner group is being patched and rolled.
    ReleaseRequested,
    /// Waiting out the soak period while SLOs are watched.
    ReleaseSoakingRequested,
    /// The release failed.
    ReleaseFailed,
    /// The soak period detected an SLO breach.
    SoakingFailed,
}

impl InstallationGroupState {
    /// All states the installation group supervisor acts on during a
    /// work cycle.
    pub const PENDING_WORK: &'static [InstallationGroupState] = &[
        InstallationGroupState::ReleasePending,
        InstallationGroupState::ReleaseRequested,
        InstallationGroupState::ReleaseSoakingRequested,
    ];

    /// States that are part of a release currently in progress.
    pub const RELEASE_IN_PROGRESS: &'static [InstallationGroupState] = &[
        InstallationGroupState::ReleaseRequested,
        InstallationGroupState::ReleaseSoakingRequested,
    ];

    /// Stable string form, as persisted and serialized.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::ReleasePending => "release-pending",
            Self::ReleaseRequested => "release-requested",
            Self::ReleaseSoakingRequested => "release-soaking-requested",
            Self::ReleaseFailed => "release-failed",
            Self::SoakingFailed => "soaking-failed",
        }
    }

    /// Returns whether a group in this state may be transitioned to
    /// `new_state`.
    #[must_use]
    pub fn valid_transition_to(&self, new_state: InstallationGroupState) -> bool {
        use InstallationGroupState as S;

        match new_state {
            S::ReleasePending => matches!(
                self,
                S::Stable
                    | S::ReleasePending
                    | S::ReleaseRequested
                    | S::ReleaseFailed
                    | S::SoakingFailed
            ),
            S::ReleaseRequested => {
                matches!(self, S::ReleaseRequested | S::ReleaseFailed | S::SoakingFailed)
            }
            S::ReleaseSoakingRequested => matches!(self, S::ReleaseRequested),
            S::Stable | S::ReleaseFailed | S::SoakingFailed => false,
        }
    }
}

impl fmt::Display for InstallationGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallationGroupState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "release-pending" => Ok(Self::ReleasePending),
            "release-requested" => Ok(Self::ReleaseRequested),
            "release-soaking-requested" => Ok(Self::ReleaseSoakingRequested),
            "release-failed" => Ok(Self::ReleaseFailed),
            "soaking-failed" => Ok(Self::SoakingFailed),
            other => Err(format!("unknown installation group state {other:?}")),
        }
    }
}

impl ToSql for InstallationGroupState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for InstallationGroupState {
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

    const ALL: &[InstallationGroupState] = &[
        InstallationGroupState::Stable,
        InstallationGroupState::ReleasePending,
        InstallationGroupState::ReleaseRequested,
        InstallationGroupState::ReleaseSoakingRequested,
        InstallationGroupState::ReleaseFailed,
        InstallationGroupState::SoakingFailed,
    ];

    #[test]
    fn string_round_trip() {
        for state in ALL {
            assert_eq!(
                state.as_str().parse::<InstallationGroupState>().unwrap(),
                *state
            );
        }
    }

    #[test]
    fn transition_table() {
        use InstallationGroupState as S;

        let allowed: &[(S, S)] = &[
            (S::Stable, S::ReleasePending),
            (S::ReleasePending, S::ReleasePending),
            (S::ReleaseRequested, S::ReleasePending),
            (S::ReleaseFailed, S::ReleasePending),
            (S::SoakingFailed, S::ReleasePending),
            (S::ReleaseRequested, S::ReleaseRequested),
            (S::ReleaseFailed, S::ReleaseRequested),
            (S::SoakingFailed, S::ReleaseRequested),
            (S::ReleaseRequested, S::ReleaseSoakingRequested),
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
}
