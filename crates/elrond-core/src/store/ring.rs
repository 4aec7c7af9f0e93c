//! Ring persistence.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::model::{new_id, now_ns, InstallationGroup, Ring, RingFilter, RingState, ALL_PER_PAGE};

use super::installation_group::{create_membership_on, get_or_create_installation_group_on};
use super::{Store, StoreError};

const RING_COLUMNS: &str = "ID, Name, Priority, SoakTime, State, Provisioner, \
     ActiveReleaseID, DesiredReleaseID, CreateAt, DeleteAt, ReleaseAt, \
     APISecurityLock, LockAcquiredBy, LockAcquiredAt";

fn row_to_ring(row: &Row<'_>) -> rusqlite::Result<Ring> {
    Ok(Ring {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: row.get(2)?,
        soak_time: row.get(3)?,
        state: row.get(4)?,
        provisioner: row.get(5)?,
        active_release_id: row.get(6)?,
        desired_release_id: row.get(7)?,
        create_at: row.get(8)?,
        delete_at: row.get(9)?,
        release_at: row.get(10)?,
        api_security_lock: row.get(11)?,
        lock_acquired_by: row.get(12)?,
        lock_acquired_at: row.get(13)?,
        installation_groups: Vec::new(),
    })
}

fn select_rings_by_state(
    conn: &Connection,
    states: &[RingState],
    extra_where: &str,
) -> Result<Vec<Ring>, StoreError> {
    let placeholders = vec!["?"; states.len()].join(", ");
    let sql = format!(
        "SELECT {RING_COLUMNS} FROM Ring
         WHERE State IN ({placeholders}) {extra_where}
         ORDER BY CreateAt ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rings = stmt
        .query_map(params_from_iter(states.iter().map(RingState::as_str)), row_to_ring)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rings)
}

impl Store {
    /// Records the given ring, assigning it a fresh ID, and registers
    /// its first installation group when one with a non-empty name is
    /// supplied. The whole operation is one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on any database failure; nothing is persisted in
    /// that case.
    pub fn create_ring(
        &self,
        ring: &mut Ring,
        installation_group: Option<&mut InstallationGroup>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        ring.id = new_id();
        ring.create_at = now_ns();

        tx.execute(
            "INSERT INTO Ring (ID, Name, Priority, SoakTime, State, Provisioner,
                 ActiveReleaseID, DesiredReleaseID, CreateAt, DeleteAt, ReleaseAt,
                 APISecurityLock, LockAcquiredBy, LockAcquiredAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, 0)",
            params![
                ring.id,
                ring.name,
                ring.priority,
                ring.soak_time,
                ring.state,
                ring.provisioner,
                ring.active_release_id,
                ring.desired_release_id,
                ring.create_at,
                ring.delete_at,
                ring.release_at,
                ring.api_security_lock,
            ],
        )?;

        if let Some(group) = installation_group {
            if !group.name.is_empty() {
                *group = get_or_create_installation_group_on(&tx, group)?;
                create_membership_on(&tx, &ring.id, &group.id)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetches the given ring by ID. Returns `None` when no such ring
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_ring(&self, id: &str) -> Result<Option<Ring>, StoreError> {
        let conn = self.conn()?;
        let ring = conn
            .query_row(
                &format!("SELECT {RING_COLUMNS} FROM Ring WHERE ID = ?1"),
                params![id],
                row_to_ring,
            )
            .optional()?;
        Ok(ring)
    }

    /// Fetches the requested page of rings, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_rings(&self, filter: &RingFilter) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;

        let mut sql = format!("SELECT {RING_COLUMNS} FROM Ring");
        if !filter.include_deleted {
            sql.push_str(" WHERE DeleteAt = 0");
        }
        sql.push_str(" ORDER BY CreateAt ASC");
        if filter.per_page != ALL_PER_PAGE {
            sql.push_str(&format!(
                " LIMIT {} OFFSET {}",
                filter.per_page,
                filter.page * filter.per_page
            ));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rings = stmt
            .query_map([], row_to_ring)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rings)
    }

    /// Rings in a pending-work state that no instance currently holds a
    /// lock on, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_unlocked_rings_pending_work(&self) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;
        select_rings_by_state(&conn, RingState::PENDING_WORK, "AND LockAcquiredAt = 0")
    }

    /// All rings in a pending-work state, locked or not. Used by the
    /// failure fan-out to abort a coordinated rollout.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_rings_pending_work(&self) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;
        select_rings_by_state(&conn, RingState::PENDING_WORK, "")
    }

    /// Rings in any release-in-progress state.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_rings_release_in_progress(&self) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;
        select_rings_by_state(&conn, RingState::RELEASE_IN_PROGRESS, "")
    }

    /// Rings with a release submitted but not yet admitted
    /// (release-pending or release-paused).
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_rings_in_pending_state(&self) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;
        select_rings_by_state(&conn, RingState::RELEASE_PENDING, "")
    }

    /// Rings currently under a row lock.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_rings_locked(&self) -> Result<Vec<Ring>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RING_COLUMNS} FROM Ring WHERE LockAcquiredAt > 0 ORDER BY CreateAt ASC"
        ))?;
        let rings = stmt
            .query_map([], row_to_ring)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rings)
    }

    /// Persists the mutable fields of the given ring.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn update_ring(&self, ring: &Ring) -> Result<(), StoreError> {
        let conn = self.conn()?;
        update_ring_on(&conn, ring)?;
        Ok(())
    }

    /// Persists updates for all supplied rings in one transaction; no
    /// ring is modified unless every update applies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when any ring in the batch does
    /// not exist; the transaction is rolled back.
    pub fn update_rings(&self, rings: &[Ring]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for ring in rings {
            let affected = update_ring_on(&tx, ring)?;
            if affected != 1 {
                return Err(StoreError::NotFound {
                    entity: "ring",
                    id: ring.id.clone(),
                });
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Marks the ring as deleted, removes its memberships, and deletes
    /// installation groups that belonged only to it, all in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn delete_ring(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE Ring SET DeleteAt = ?1 WHERE ID = ?2 AND DeleteAt = 0",
            params![now_ns(), id],
        )?;
        tx.execute(
            "DELETE FROM InstallationGroup
             WHERE ID IN (SELECT InstallationGroupID FROM RingInstallationGroup WHERE RingID = ?1)
               AND ID NOT IN (SELECT InstallationGroupID FROM RingInstallationGroup WHERE RingID <> ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM RingInstallationGroup WHERE RingID = ?1",
            params![id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Marks the ring as locked for exclusive use by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn lock_ring(&self, ring_id: &str, locker_id: &str) -> Result<bool, StoreError> {
        self.lock_rows("Ring", &[ring_id], locker_id)
    }

    /// Locks all given rings, or none of them.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn lock_rings(&self, ring_ids: &[&str], locker_id: &str) -> Result<bool, StoreError> {
        self.lock_rows("Ring", ring_ids, locker_id)
    }

    /// Releases a lock previously acquired by `locker_id`; `force`
    /// ignores the owner and is reserved for operator overrides and
    /// stale-lock reclamation.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn unlock_ring(
        &self,
        ring_id: &str,
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        self.unlock_rows("Ring", &[ring_id], locker_id, force)
    }

    /// Unlocks all given rings.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn unlock_rings(
        &self,
        ring_ids: &[&str],
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        self.unlock_rows("Ring", ring_ids, locker_id, force)
    }

    /// Rejects API writes for the ring until cleared.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn lock_ring_api(&self, ring_id: &str) -> Result<(), StoreError> {
        self.set_ring_api_lock(ring_id, true)
    }

    /// Clears the API security lock.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn unlock_ring_api(&self, ring_id: &str) -> Result<(), StoreError> {
        self.set_ring_api_lock(ring_id, false)
    }

    fn set_ring_api_lock(&self, ring_id: &str, lock: bool) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE Ring SET APISecurityLock = ?1 WHERE ID = ?2",
            params![lock, ring_id],
        )?;
        Ok(())
    }
}

fn update_ring_on(conn: &Connection, ring: &Ring) -> Result<usize, StoreError> {
    let affected = conn.execute(
        "UPDATE Ring
         SET Name = ?1, Priority = ?2, SoakTime = ?3, State = ?4, Provisioner = ?5,
             ActiveReleaseID = ?6, DesiredReleaseID = ?7, ReleaseAt = ?8
         WHERE ID = ?9",
        params![
            ring.name,
            ring.priority,
            ring.soak_time,
            ring.state,
            ring.provisioner,
            ring.active_release_id,
            ring.desired_release_id,
            ring.release_at,
            ring.id,
        ],
    )?;
    Ok(affected)
}
