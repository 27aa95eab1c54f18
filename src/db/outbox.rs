//! Outbox rows written in the same transaction as task mutations.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, OutboxEvent, StoreTx};

impl StoreTx {
    /// Record an event for the relay to publish once this transaction commits
    pub async fn enqueue_outbox_event(&mut self, topic: &str, payload: &str) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_events (topic, payload, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(topic)
        .bind(payload)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert outbox event: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }
}

impl Database {
    /// Oldest undelivered outbox events, in write order
    pub async fn list_undelivered_outbox_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, payload, created_at, delivered_at
            FROM outbox_events
            WHERE delivered_at IS NULL
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list outbox events: {}",
                e
            )))
        })
    }

    /// Mark an outbox event as published
    pub async fn mark_outbox_event_delivered(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox_events SET delivered_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to mark outbox event delivered: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete delivered events published before `before` (unix seconds)
    ///
    /// Returns the number of rows removed.
    pub async fn purge_delivered_outbox_events(&self, before: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE delivered_at IS NOT NULL AND delivered_at < ?",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to purge outbox events: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Number of outbox events, delivered or not
    pub async fn count_outbox_events(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count outbox events: {}",
                    e
                )))
            })
    }

    /// Number of events still waiting for the relay
    pub async fn count_undelivered_outbox_events(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE delivered_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count undelivered outbox events: {}",
                    e
                )))
            })
    }
}
