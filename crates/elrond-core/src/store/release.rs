//! Ring release persistence and content addressing.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ns, RingRelease};

use super::{Store, StoreError};

const RELEASE_COLUMNS: &str =
    "ID, Image, Version, EnvVariables, ReadinessProbe, LivenessProbe, CreateAt, Force";

fn row_to_release(row: &Row<'_>) -> rusqlite::Result<RingRelease> {
    let env_raw: String = row.get(3)?;
    let readiness_raw: String = row.get(4)?;
    let liveness_raw: String = row.get(5)?;

    let env_variables = serde_json::from_str(&env_raw)
        .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))?;
    let parse_probe = |raw: &str| -> rusqlite::Result<Option<serde_json::Value>> {
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)).into())
    };

    Ok(RingRelease {
        id: row.get(0)?,
        image: row.get(1)?,
        version: row.get(2)?,
        env_variables,
        readiness_probe: parse_probe(&readiness_raw)?,
        liveness_probe: parse_probe(&liveness_raw)?,
        create_at: row.get(6)?,
        force: row.get(7)?,
    })
}

impl Store {
    /// Fetches the given ring release by ID. Returns `None` when no such
    /// release exists.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_ring_release(&self, release_id: &str) -> Result<Option<RingRelease>, StoreError> {
        let conn = self.conn()?;
        let release = conn
            .query_row(
                &format!("SELECT {RELEASE_COLUMNS} FROM RingRelease WHERE ID = ?1 LIMIT 1"),
                params![release_id],
                row_to_release,
            )
            .optional()?;
        Ok(release)
    }

    /// Returns the release matching the full content tuple `(image,
    /// version, force, envVariables, readinessProbe, livenessProbe)`,
    /// inserting it with a fresh ID on a miss. Idempotent: a release-all
    /// for the same inputs reuses one release record across rings.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_or_create_ring_release(
        &self,
        release: &RingRelease,
    ) -> Result<RingRelease, StoreError> {
        let env_json = release.env_variables_json();
        let readiness_json = RingRelease::probe_json(release.readiness_probe.as_ref());
        let liveness_json = RingRelease::probe_json(release.liveness_probe.as_ref());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {RELEASE_COLUMNS} FROM RingRelease
                     WHERE Image = ?1 AND Version = ?2 AND Force = ?3
                       AND EnvVariables = ?4 AND ReadinessProbe = ?5 AND LivenessProbe = ?6
                     LIMIT 1"
                ),
                params![
                    release.image,
                    release.version,
                    release.force,
                    env_json,
                    readiness_json,
                    liveness_json,
                ],
                row_to_release,
            )
            .optional()?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let mut created = release.clone();
        created.id = new_id();
        created.create_at = now_ns();
        tx.execute(
            "INSERT INTO RingRelease
                 (ID, Image, Version, EnvVariables, ReadinessProbe, LivenessProbe, CreateAt, Force)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                created.id,
                created.image,
                created.version,
                env_json,
                readiness_json,
                liveness_json,
                created.create_at,
                created.force,
            ],
        )?;
        tx.commit()?;

        Ok(created)
    }

    /// Number of release records, used by tests asserting dedup growth.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn count_ring_releases(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM RingRelease", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn release(image: &str, version: &str, force: bool) -> RingRelease {
        RingRelease {
            id: String::new(),
            image: image.to_string(),
            version: version.to_string(),
            force,
            env_variables: BTreeMap::new(),
            readiness_probe: None,
            liveness_probe: None,
            create_at: 0,
        }
    }

    #[test]
    fn identical_content_dedupes_to_one_record() {
        let store = Store::open_in_memory().unwrap();

        let first = store
            .get_or_create_ring_release(&release("app", "1.0", false))
            .unwrap();
        let second = store
            .get_or_create_ring_release(&release("app", "1.0", false))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.count_ring_releases().unwrap(), 1);
    }

    #[test]
    fn differing_content_creates_distinct_records() {
        let store = Store::open_in_memory().unwrap();

        let base = store
            .get_or_create_ring_release(&release("app", "1.0", false))
            .unwrap();

        let forced = store
            .get_or_create_ring_release(&release("app", "1.0", true))
            .unwrap();
        assert_ne!(base.id, forced.id);

        let mut with_env = release("app", "1.0", false);
        with_env
            .env_variables
            .insert("FEATURE".to_string(), "on".to_string());
        let enved = store.get_or_create_ring_release(&with_env).unwrap();
        assert_ne!(base.id, enved.id);

        let mut with_probe = release("app", "1.0", false);
        with_probe.readiness_probe = Some(serde_json::json!({"httpGet": {"path": "/health"}}));
        let probed = store.get_or_create_ring_release(&with_probe).unwrap();
        assert_ne!(base.id, probed.id);

        assert_eq!(store.count_ring_releases().unwrap(), 4);
    }

    #[test]
    fn env_key_order_does_not_change_identity() {
        let store = Store::open_in_memory().unwrap();

        let mut a = release("app", "1.0", false);
        a.env_variables.insert("A".into(), "1".into());
        a.env_variables.insert("B".into(), "2".into());

        let mut b = release("app", "1.0", false);
        b.env_variables.insert("B".into(), "2".into());
        b.env_variables.insert("A".into(), "1".into());

        let first = store.get_or_create_ring_release(&a).unwrap();
        let second = store.get_or_create_ring_release(&b).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn round_trips_env_and_probes() {
        let store = Store::open_in_memory().unwrap();

        let mut release = release("app", "2.0", false);
        release.env_variables.insert("K".into(), "v".into());
        release.readiness_probe = Some(serde_json::json!({"httpGet": {"port": 8080}}));
        release.liveness_probe = Some(serde_json::json!({"tcpSocket": {"port": 8080}}));

        let created = store.get_or_create_ring_release(&release).unwrap();
        let fetched = store.get_ring_release(&created.id).unwrap().unwrap();

        assert_eq!(fetched.env_variables.get("K").map(String::as_str), Some("v"));
        assert_eq!(fetched.readiness_probe, release.readiness_probe);
        assert_eq!(fetched.liveness_probe, release.liveness_probe);
        assert!(fetched.create_at > 0);
    }
}
