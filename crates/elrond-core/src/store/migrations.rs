//! Semver-chained schema migrations.
//!
//! The canonical schema is obtained by applying all migrations to an
//! empty database. The `System` table records the version reached; the
//! server refuses to start when the stored version is older than, or
//! differs in major version from, the version it was built against.

use rusqlite::Transaction;
use semver::Version;

use super::{Store, StoreError};

struct Migration {
    to_version: &'static str,
    up: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        to_version: "0.1.0",
        up: |tx| {
            tx.execute_batch(
                "CREATE TABLE System (
                    Key VARCHAR(64) PRIMARY KEY,
                    Value VARCHAR(1024) NULL
                );

                CREATE TABLE Ring (
                    ID CHAR(26) PRIMARY KEY,
                    Name TEXT NOT NULL,
                    Priority INT NOT NULL,
                    SoakTime INT NOT NULL,
                    State TEXT NOT NULL,
                    Provisioner TEXT NOT NULL,
                    ActiveReleaseID TEXT NOT NULL,
                    DesiredReleaseID TEXT NOT NULL,
                    CreateAt BIGINT NOT NULL,
                    DeleteAt BIGINT NOT NULL,
                    ReleaseAt BIGINT NOT NULL,
                    APISecurityLock BOOLEAN NOT NULL,
                    LockAcquiredBy CHAR(26) NULL,
                    LockAcquiredAt BIGINT NOT NULL
                );

                CREATE TABLE InstallationGroup (
                    ID CHAR(26) PRIMARY KEY,
                    Name TEXT NOT NULL,
                    State TEXT NOT NULL,
                    ReleaseAt BIGINT NOT NULL,
                    SoakTime INT NOT NULL,
                    ProvisionerGroupID TEXT NOT NULL,
                    LockAcquiredBy CHAR(26) NULL,
                    LockAcquiredAt BIGINT NOT NULL
                );

                CREATE TABLE RingInstallationGroup (
                    ID CHAR(26) PRIMARY KEY,
                    RingID CHAR(26) NOT NULL,
                    InstallationGroupID CHAR(26) NOT NULL
                );

                CREATE UNIQUE INDEX RingInstallationGroup_RingID_InstallationGroupID
                    ON RingInstallationGroup (RingID, InstallationGroupID);

                CREATE TABLE RingRelease (
                    ID CHAR(26) PRIMARY KEY,
                    Image TEXT NOT NULL,
                    Version TEXT NOT NULL,
                    CreateAt BIGINT NOT NULL,
                    Force BOOLEAN NOT NULL
                );

                CREATE UNIQUE INDEX RingRelease_Image_Version_Force
                    ON RingRelease (Image, Version, Force);

                CREATE TABLE Webhooks (
                    ID CHAR(26) PRIMARY KEY,
                    OwnerID TEXT NOT NULL,
                    URL TEXT NOT NULL,
                    CreateAt BIGINT NOT NULL,
                    DeleteAt BIGINT NOT NULL
                );

                CREATE UNIQUE INDEX Webhook_URL_DeleteAt
                    ON Webhooks (URL, DeleteAt);",
            )
        },
    },
    // Widen release identity to the full content tuple so that releases
    // differing only in env variables or probes get distinct records.
    Migration {
        to_version: "0.2.0",
        up: |tx| {
            tx.execute_batch(
                "ALTER TABLE RingRelease RENAME TO RingReleaseTemp;

                CREATE TABLE RingRelease (
                    ID CHAR(26) PRIMARY KEY,
                    Image TEXT NOT NULL,
                    Version TEXT NOT NULL,
                    EnvVariables TEXT NOT NULL,
                    ReadinessProbe TEXT NOT NULL,
                    LivenessProbe TEXT NOT NULL,
                    CreateAt BIGINT NOT NULL,
                    Force BOOLEAN NOT NULL
                );

                INSERT INTO RingRelease
                SELECT ID, Image, Version, '{}', '', '', CreateAt, Force
                FROM RingReleaseTemp;

                DROP TABLE RingReleaseTemp;

                CREATE UNIQUE INDEX RingRelease_Content
                    ON RingRelease (Image, Version, Force, EnvVariables, ReadinessProbe, LivenessProbe);",
            )
        },
    },
];

const VERSION_KEY: &str = "DatabaseVersion";

impl Store {
    /// The schema version this build expects.
    ///
    /// # Panics
    ///
    /// Panics if the compiled-in migration chain is empty, which cannot
    /// happen.
    #[must_use]
    pub fn latest_version() -> Version {
        Version::parse(MIGRATIONS.last().expect("migration chain is non-empty").to_version)
            .expect("migration versions are valid semver")
    }

    /// Reads the schema version recorded in the `System` table. A
    /// database without a `System` table reports `0.0.0`.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure or an unparseable stored
    /// version.
    pub fn current_version(&self) -> Result<Version, StoreError> {
        let conn = self.conn()?;
        current_version_on(&conn)
    }

    /// Applies every migration newer than the current version, each step
    /// in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns an error when a step fails; previously applied steps
    /// remain committed.
    pub fn migrate(&self) -> Result<Version, StoreError> {
        let mut conn = self.conn()?;
        let mut current = current_version_on(&conn)?;

        for migration in MIGRATIONS {
            let to_version = Version::parse(migration.to_version)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            if to_version <= current {
                continue;
            }

            let tx = conn.transaction()?;
            (migration.up)(&tx)?;
            tx.execute(
                "INSERT INTO System (Key, Value) VALUES (?1, ?2)
                 ON CONFLICT (Key) DO UPDATE SET Value = ?2",
                rusqlite::params![VERSION_KEY, migration.to_version],
            )?;
            tx.commit()?;

            tracing::debug!(version = %to_version, "applied schema migration");
            current = to_version;
        }

        Ok(current)
    }

    /// Verifies the stored schema is compatible with this server build:
    /// at least the built-in version, and the same major version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaMismatch`] when the versions are
    /// incompatible.
    pub fn check_version(&self) -> Result<(), StoreError> {
        let current = self.current_version()?;
        let required = Self::latest_version();
        if current < required || current.major != required.major {
            return Err(StoreError::SchemaMismatch { current, required });
        }
        Ok(())
    }
}

fn current_version_on(conn: &rusqlite::Connection) -> Result<Version, StoreError> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'System')",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Ok(Version::new(0, 0, 0));
    }

    use rusqlite::OptionalExtension;
    let stored: Option<String> = conn
        .query_row(
            "SELECT Value FROM System WHERE Key = ?1",
            rusqlite::params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        Some(raw) => Version::parse(&raw).map_err(|e| StoreError::Migration(e.to_string())),
        None => Ok(Version::new(0, 0, 0)),
    }
}
