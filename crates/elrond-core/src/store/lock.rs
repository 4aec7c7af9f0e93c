//! Advisory row locks.
//!
//! A lock is held when `LockAcquiredAt > 0`. Acquisition is a
//! conditional UPDATE restricted to currently-unlocked rows, executed in
//! a transaction so that multi-row acquisition is all-or-nothing even
//! with concurrent lockers.

use rusqlite::params_from_iter;
use rusqlite::types::Value;

use crate::model::now_ns;

use super::{Store, StoreError};

impl Store {
    pub(super) fn lock_rows(
        &self,
        table: &str,
        ids: &[&str],
        locker_id: &str,
    ) -> Result<bool, StoreError> {
        if ids.is_empty() {
            return Ok(true);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; ids.len()].join(", ");
        let unlocked: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} WHERE ID IN ({placeholders}) AND LockAcquiredAt = 0"
            ),
            params_from_iter(ids.iter()),
            |row| row.get(0),
        )?;
        if unlocked != ids.len() as i64 {
            return Ok(false);
        }

        let mut params: Vec<Value> = vec![
            Value::Text(locker_id.to_string()),
            Value::Integer(now_ns()),
        ];
        params.extend(ids.iter().map(|id| Value::Text((*id).to_string())));
        tx.execute(
            &format!(
                "UPDATE {table}
                 SET LockAcquiredBy = ?, LockAcquiredAt = ?
                 WHERE ID IN ({placeholders}) AND LockAcquiredAt = 0"
            ),
            params_from_iter(params),
        )?;
        tx.commit()?;

        Ok(true)
    }

    pub(super) fn unlock_rows(
        &self,
        table: &str,
        ids: &[&str],
        locker_id: &str,
        force: bool,
    ) -> Result<bool, StoreError> {
        if ids.is_empty() {
            return Ok(true);
        }

        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");

        let affected = if force {
            conn.execute(
                &format!(
                    "UPDATE {table}
                     SET LockAcquiredBy = NULL, LockAcquiredAt = 0
                     WHERE ID IN ({placeholders}) AND LockAcquiredAt > 0"
                ),
                params_from_iter(ids.iter()),
            )?
        } else {
            let mut params: Vec<Value> =
                ids.iter().map(|id| Value::Text((*id).to_string())).collect();
            params.push(Value::Text(locker_id.to_string()));
            conn.execute(
                &format!(
                    "UPDATE {table}
                     SET LockAcquiredBy = NULL, LockAcquiredAt = 0
                     WHERE ID IN ({placeholders}) AND LockAcquiredBy = ?"
                ),
                params_from_iter(params),
            )?
        };

        Ok(affected == ids.len())
    }
}
