//! Installation group persistence and ring membership.

use std::collections::BTreeMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::model::{new_id, InstallationGroup, InstallationGroupState, Ring, RingFilter};

use super::{Store, StoreError};

const GROUP_COLUMNS: &str =
    "ID, Name, State, ReleaseAt, SoakTime, ProvisionerGroupID, LockAcquiredBy, LockAcquiredAt";

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<InstallationGroup> {
    Ok(InstallationGroup {
        id: row.get(0)?,
        name: row.get(1)?,
        state: row.get(2)?,
        release_at: row.get(3)?,
        soak_time: row.get(4)?,
        provisioner_group_id: row.get(5)?,
        lock_acquired_by: row.get(6)?,
        lock_acquired_at: row.get(7)?,
    })
}

pub(super) fn get_installation_group_by_name_on(
    conn: &Connection,
    name: &str,
) -> Result<Option<InstallationGroup>, StoreError> {
    let group = conn
        .query_row(
            &format!("SELECT {GROUP_COLUMNS} FROM InstallationGroup WHERE Name = ?1 LIMIT 1"),
            params![name],
            row_to_group,
        )
        .optional()?;
    Ok(group)
}

pub(super) fn create_installation_group_on(
    conn: &Connection,
    group: &mut InstallationGroup,
) -> Result<(), StoreError> {
    group.id = new_id();
    conn.execute(
        "INSERT INTO InstallationGroup
             (ID, Name, State, ReleaseAt, SoakTime, ProvisionerGroupID, LockAcquiredBy, LockAcquiredAt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0)",
        params![
            group.id,
            group.name,
            group.state,
            group.release_at,
            group.soak_time,
            group.provisioner_group_id,
        ],
    )?;
    Ok(())
}

/// Reuses an existing group with the same name, or creates a new one.
pub(super) fn get_or_create_installation_group_on(
    conn: &Connection,
    group: &InstallationGroup,
) -> Result<InstallationGroup, StoreError> {
    if let Some(existing) = get_installation_group_by_name_on(conn, &group.name)? {
        return Ok(existing);
    }
    let mut created = group.clone();
    create_installation_group_on(conn, &mut created)?;
    Ok(created)
}

pub(super) fn create_membership_on(
    conn: &Connection,
    ring_id: &str,
    installation_group_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO RingInstallationGroup (ID, RingID, InstallationGroupID)
         VALUES (?1, ?2, ?3)",
        params![new_id(), ring_id, installation_group_id],
    )?;
    Ok(())
}

impl Store {
    /// Fetches the given installation group by ID. Returns `None` when
    /// no such group exists.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_group_by_id(
        &self,
        id: &str,
    ) -> Result<Option<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        let group = conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM InstallationGroup WHERE ID = ?1 LIMIT 1"),
                params![id],
                row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    /// Fetches the given installation group by name. Returns `None` when
    /// no such group exists.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_group_by_name(
        &self,
        name: &str,
    ) -> Result<Option<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        get_installation_group_by_name_on(&conn, name)
    }

    /// Registers an installation group with the ring. The group itself
    /// is idempotent on name; the membership must be unique per
    /// `(ring, group)` and fails with a uniqueness violation otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure; a duplicate membership
    /// reports `true` from [`StoreError::is_unique_violation`].
    pub fn create_ring_installation_group(
        &self,
        ring_id: &str,
        group: &InstallationGroup,
    ) -> Result<InstallationGroup, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let group = get_or_create_installation_group_on(&tx, group)?;
        create_membership_on(&tx, ring_id, &group.id)?;
        tx.commit()?;
        Ok(group)
    }

    /// Removes an installation group from the given ring. Removing a
    /// group that is not registered is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn delete_ring_installation_group(
        &self,
        ring_id: &str,
        installation_group_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM RingInstallationGroup WHERE RingID = ?1 AND InstallationGroupID = ?2",
            params![ring_id, installation_group_id],
        )?;
        Ok(())
    }

    /// All installation groups registered to the ring.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_groups_for_ring(
        &self,
        ring_id: &str,
    ) -> Result<Vec<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM InstallationGroup
             WHERE ID IN (SELECT InstallationGroupID FROM RingInstallationGroup WHERE RingID = ?1)
             ORDER BY Name ASC"
        ))?;
        let groups = stmt
            .query_map(params![ring_id], row_to_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Installation groups for every ring matched by the filter, keyed
    /// by ring ID. Used to decorate list responses in one query.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_groups_for_rings(
        &self,
        filter: &RingFilter,
    ) -> Result<BTreeMap<String, Vec<InstallationGroup>>, StoreError> {
        let conn = self.conn()?;

        let mut sql = format!(
            "SELECT RingInstallationGroup.RingID,
                    InstallationGroup.ID, InstallationGroup.Name, InstallationGroup.State,
                    InstallationGroup.ReleaseAt, InstallationGroup.SoakTime,
                    InstallationGroup.ProvisionerGroupID,
                    InstallationGroup.LockAcquiredBy, InstallationGroup.LockAcquiredAt
             FROM RingInstallationGroup
             JOIN InstallationGroup ON InstallationGroup.ID = RingInstallationGroup.InstallationGroupID
             JOIN Ring ON Ring.ID = RingInstallationGroup.RingID"
        );
        if !filter.include_deleted {
            sql.push_str(" WHERE Ring.DeleteAt = 0");
        }
        sql.push_str(" ORDER BY Ring.CreateAt ASC, InstallationGroup.Name ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let ring_id: String = row.get(0)?;
            let group = InstallationGroup {
                id: row.get(1)?,
                name: row.get(2)?,
                state: row.get(3)?,
                release_at: row.get(4)?,
                soak_time: row.get(5)?,
                provisioner_group_id: row.get(6)?,
                lock_acquired_by: row.get(7)?,
                lock_acquired_at: row.get(8)?,
            };
            Ok((ring_id, group))
        })?;

        let mut map: BTreeMap<String, Vec<InstallationGroup>> = BTreeMap::new();
        for row in rows {
            let (ring_id, group) = row?;
            map.entry(ring_id).or_default().push(group);
        }
        Ok(map)
    }

    /// Resolves the ring that owns the given installation group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the group has no
    /// membership, or an error on a database failure.
    pub fn get_ring_from_installation_group_id(
        &self,
        installation_group_id: &str,
    ) -> Result<Ring, StoreError> {
        let ring_id: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT RingID FROM RingInstallationGroup WHERE InstallationGroupID = ?1 LIMIT 1",
                params![installation_group_id],
                |row| row.get(0),
            )
            .optional()?
        };

        let ring_id = ring_id.ok_or_else(|| StoreError::NotFound {
            entity: "ring membership for installation group",
            id: installation_group_id.to_string(),
        })?;
        self.get_ring(&ring_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "ring",
            id: ring_id,
        })
    }

    /// Unlocked installation groups in a pending-work state.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_groups_pending_work(
        &self,
    ) -> Result<Vec<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        self.select_groups_by_state(
            &conn,
            InstallationGroupState::PENDING_WORK,
            "AND LockAcquiredAt = 0",
        )
    }

    /// Unlocked installation groups in a release-in-progress state.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_groups_release_in_progress(
        &self,
    ) -> Result<Vec<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        self.select_groups_by_state(
            &conn,
            InstallationGroupState::RELEASE_IN_PROGRESS,
            "AND LockAcquiredAt = 0",
        )
    }

    /// Installation groups currently under a row lock.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_installation_groups_locked(&self) -> Result<Vec<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM InstallationGroup WHERE LockAcquiredAt > 0"
        ))?;
        let groups = stmt
            .query_map([], row_to_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Installation groups of the given ring in a pending-work state.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_ring_installation_groups_pending_work(
        &self,
        ring_id: &str,
    ) -> Result<Vec<InstallationGroup>, StoreError> {
        let conn = self.conn()?;
        let states = InstallationGroupState::PENDING_WORK;
        let placeholders = vec!["?"; states.len()].join(", ");

        let mut params: Vec<String> = vec![ring_id.to_string()];
        params.extend(states.iter().map(|s| s.as_str().to_string()));

        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM InstallationGroup
             WHERE ID IN (SELECT InstallationGroupID FROM RingInstallationGroup WHERE RingID = ?)
               AND State IN ({placeholders})"
        ))?;
        let groups = stmt
            .query_map(params_from_iter(params.iter()), row_to_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Persists the mutable fields of the given installation group.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn update_installation_group(&self, group: &InstallationGroup) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE InstallationGroup
             SET Name = ?1, State = ?2, ReleaseAt = ?3, SoakTime = ?4, ProvisionerGroupID = ?5
             WHERE ID = ?6",
            params![
                group.name,
                group.state,
                group.release_at,
                group.soak_time,
                group.provisioner_group_id,
                group.id,
            ],
        )?;
        Ok(())
    }

    /// Marks the installation group as locked for exclusive use by the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn lock_installation_group(
        &self,
        installation_group_id: &str,
        locker_id: &str,
    ) -> Result<bool, StoreError> {
        self.lock_rows("InstallationGroup", &[installation_group_id], locker_id)
    }

    /// Releases a lock previously acquired by `locker_id`; `force`
    /// ignores the owner.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn unlock_installation_group(
        &self,
        installation_group_id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        self.unlock_rows("InstallationGroup", &[installation_group_id], locker_id, force)
    }

    fn select_groups_by_state(
        &self,
        conn: &Connection,
        states: &[InstallationGroupState],
        extra_where: &str,
    ) -> Result<Vec<InstallationGroup>, StoreError> {
        let placeholders = vec!["?"; states.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM InstallationGroup
             WHERE State IN ({placeholders}) {extra_where}"
        ))?;
        let groups = stmt
            .query_map(
                params_from_iter(states.iter().map(InstallationGroupState::as_str)),
                row_to_group,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PROVISIONER_NAME, RingState};

    fn seeded_ring(store: &Store) -> Ring {
        let mut ring = Ring {
            id: String::new(),
            name: "ring-0".to_string(),
            priority: 1,
            soak_time: 60,
            state: RingState::Stable,
            provisioner: PROVISIONER_NAME.to_string(),
            active_release_id: String::new(),
            desired_release_id: String::new(),
            create_at: 0,
            delete_at: 0,
            release_at: 0,
            api_security_lock: false,
            lock_acquired_by: None,
            lock_acquired_at: 0,
            installation_groups: Vec::new(),
        };
        store.create_ring(&mut ring, None).unwrap();
        ring
    }

    fn test_group(name: &str) -> InstallationGroup {
        InstallationGroup {
            id: String::new(),
            name: name.to_string(),
            state: InstallationGroupState::Stable,
            release_at: 0,
            soak_time: 0,
            provisioner_group_id: format!("pg-{name}"),
            lock_acquired_by: None,
            lock_acquired_at: 0,
        }
    }

    #[test]
    fn membership_is_unique_per_ring_and_group() {
        let store = Store::open_in_memory().unwrap();
        let ring = seeded_ring(&store);

        let group = store
            .create_ring_installation_group(&ring.id, &test_group("group-0"))
            .unwrap();

        // Registering the same name again reuses the group, so the
        // membership insert violates the unique index.
        let err = store
            .create_ring_installation_group(&ring.id, &test_group("group-0"))
            .unwrap_err();
        assert!(err.is_unique_violation());

        let groups = store.get_installation_groups_for_ring(&ring.id).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, group.id);
    }

    #[test]
    fn get_or_create_reuses_group_by_name() {
        let store = Store::open_in_memory().unwrap();
        let ring_a = seeded_ring(&store);
        let mut ring_b = Ring {
            name: "ring-1".to_string(),
            ..ring_a.clone()
        };
        ring_b.id = String::new();
        store.create_ring(&mut ring_b, None).unwrap();

        let first = store
            .create_ring_installation_group(&ring_a.id, &test_group("shared"))
            .unwrap();
        let second = store
            .create_ring_installation_group(&ring_b.id, &test_group("shared"))
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn resolves_owning_ring() {
        let store = Store::open_in_memory().unwrap();
        let ring = seeded_ring(&store);
        let group = store
            .create_ring_installation_group(&ring.id, &test_group("group-0"))
            .unwrap();

        let owner = store.get_ring_from_installation_group_id(&group.id).unwrap();
        assert_eq!(owner.id, ring.id);

        let err = store
            .get_ring_from_installation_group_id("unknown")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn pending_work_filters_by_state_and_lock() {
        let store = Store::open_in_memory().unwrap();
        let ring = seeded_ring(&store);
        let mut group = store
            .create_ring_installation_group(&ring.id, &test_group("group-0"))
            .unwrap();

        assert!(store.get_installation_groups_pending_work().unwrap().is_empty());

        group.state = InstallationGroupState::ReleasePending;
        store.update_installation_group(&group).unwrap();
        assert_eq!(store.get_installation_groups_pending_work().unwrap().len(), 1);
        assert_eq!(
            store
                .get_ring_installation_groups_pending_work(&ring.id)
                .unwrap()
                .len(),
            1
        );

        assert!(store.lock_installation_group(&group.id, "me").unwrap());
        assert!(store.get_installation_groups_pending_work().unwrap().is_empty());
        assert_eq!(store.get_installation_groups_locked().unwrap().len(), 1);
    }

    #[test]
    fn groups_for_rings_maps_by_ring_id() {
        let store = Store::open_in_memory().unwrap();
        let ring = seeded_ring(&store);
        store
            .create_ring_installation_group(&ring.id, &test_group("b-group"))
            .unwrap();
        store
            .create_ring_installation_group(&ring.id, &test_group("a-group"))
            .unwrap();

        let map = store
            .get_installation_groups_for_rings(&RingFilter::all())
            .unwrap();
        let groups = map.get(&ring.id).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "a-group");
    }
}
