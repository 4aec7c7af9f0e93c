//! Webhook registration persistence.

use rusqlite::{params, OptionalExtension, Row};

use crate::model::{new_id, now_ns, Webhook, WebhookFilter, ALL_PER_PAGE};

use super::{Store, StoreError};

const WEBHOOK_COLUMNS: &str = "ID, OwnerID, URL, CreateAt, DeleteAt";

fn row_to_webhook(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        url: row.get(2)?,
        create_at: row.get(3)?,
        delete_at: row.get(4)?,
    })
}

impl Store {
    /// Records the given webhook, assigning it a fresh ID. The pair
    /// `(URL, DeleteAt)` is unique, so registering the same live URL
    /// twice fails with a uniqueness violation.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure; a duplicate URL reports
    /// `true` from [`StoreError::is_unique_violation`].
    pub fn create_webhook(&self, webhook: &mut Webhook) -> Result<(), StoreError> {
        webhook.id = new_id();
        webhook.create_at = now_ns();
        webhook.delete_at = 0;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO Webhooks (ID, OwnerID, URL, CreateAt, DeleteAt)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                webhook.id,
                webhook.owner_id,
                webhook.url,
                webhook.create_at,
                webhook.delete_at,
            ],
        )?;
        Ok(())
    }

    /// Fetches the given webhook by ID. Returns `None` when no such
    /// webhook exists.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_webhook(&self, id: &str) -> Result<Option<Webhook>, StoreError> {
        let conn = self.conn()?;
        let webhook = conn
            .query_row(
                &format!("SELECT {WEBHOOK_COLUMNS} FROM Webhooks WHERE ID = ?1 LIMIT 1"),
                params![id],
                row_to_webhook,
            )
            .optional()?;
        Ok(webhook)
    }

    /// Fetches the requested page of webhooks, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_webhooks(&self, filter: &WebhookFilter) -> Result<Vec<Webhook>, StoreError> {
        let conn = self.conn()?;

        let mut sql = format!("SELECT {WEBHOOK_COLUMNS} FROM Webhooks");
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
        let webhooks = stmt
            .query_map([], row_to_webhook)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(webhooks)
    }

    /// Marks the given webhook as deleted, but does not remove the
    /// record.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn delete_webhook(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE Webhooks SET DeleteAt = ?1 WHERE ID = ?2 AND DeleteAt = 0",
            params![now_ns(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_webhook(url: &str) -> Webhook {
        Webhook {
            id: String::new(),
            owner_id: "owner".to_string(),
            url: url.to_string(),
            create_at: 0,
            delete_at: 0,
        }
    }

    #[test]
    fn create_get_delete_round_trip() {
        let store = Store::open_in_memory().unwrap();

        let mut webhook = test_webhook("https://hooks.example.com/a");
        store.create_webhook(&mut webhook).unwrap();
        assert_eq!(webhook.id.len(), 26);

        let fetched = store.get_webhook(&webhook.id).unwrap().unwrap();
        assert_eq!(fetched.url, webhook.url);

        store.delete_webhook(&webhook.id).unwrap();
        assert!(store.get_webhooks(&WebhookFilter::all()).unwrap().is_empty());
        let deleted = store.get_webhook(&webhook.id).unwrap().unwrap();
        assert!(deleted.delete_at > 0);
    }

    #[test]
    fn duplicate_live_url_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();

        let mut webhook = test_webhook("https://hooks.example.com/a");
        store.create_webhook(&mut webhook).unwrap();

        let err = store
            .create_webhook(&mut test_webhook("https://hooks.example.com/a"))
            .unwrap_err();
        assert!(err.is_unique_violation());

        // Deleting frees the URL for re-registration.
        store.delete_webhook(&webhook.id).unwrap();
        store
            .create_webhook(&mut test_webhook("https://hooks.example.com/a"))
            .unwrap();
    }
}
