//! Database layer for url-dl
//!
//! Handles SQLite persistence for download tasks, the transactional outbox and
//! runtime state.
//!
//! ## Submodules
//!
//! Methods on [`Database`] and [`StoreTx`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`download_tasks`]: Task CRUD and the exclusive row lock
//! - [`outbox`]: Outbox rows written alongside task mutations
//! - [`state`]: Runtime state (shutdown tracking)
//!
//! ## Row locking
//!
//! SQLite has no `SELECT ... FOR UPDATE`. A [`StoreTx`] takes a task's lock by
//! making its first statement a write against that row, which acquires the
//! database write lock for the rest of the transaction. Waiting for another
//! holder is bounded by the connection's `busy_timeout`; running out of it
//! surfaces as [`Error::LockTimeout`].

use crate::config::RetryConfig;
use crate::error::DatabaseError;
use crate::types::{AccountId, DownloadStatus, DownloadTask, DownloadType, Metadata, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction, sqlite::SqlitePool};

mod download_tasks;
mod migrations;
mod outbox;
mod state;

/// New download task to be inserted into the database
///
/// The store assigns the id; status starts as Pending with empty metadata.
#[derive(Debug, Clone)]
pub struct NewDownloadTask {
    /// Owning account
    pub of_account_id: AccountId,
    /// Source kind
    pub download_type: DownloadType,
    /// Source URL
    pub url: String,
}

/// Download task record as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct DownloadTaskRow {
    pub id: i64,
    pub of_account_id: i64,
    pub download_type: i32,
    pub url: String,
    pub download_status: i32,
    pub metadata: String,
    pub attempt: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<DownloadTaskRow> for DownloadTask {
    type Error = Error;

    fn try_from(row: DownloadTaskRow) -> Result<Self> {
        let download_status = DownloadStatus::from_i32(row.download_status).ok_or_else(|| {
            Error::Database(DatabaseError::CorruptRow(format!(
                "download task {} has unknown status {}",
                row.id, row.download_status
            )))
        })?;
        let download_type = DownloadType::from_i32(row.download_type).ok_or_else(|| {
            Error::Database(DatabaseError::CorruptRow(format!(
                "download task {} has unknown download type {}",
                row.id, row.download_type
            )))
        })?;
        let metadata: Metadata = serde_json::from_str(&row.metadata).map_err(|e| {
            Error::Database(DatabaseError::CorruptRow(format!(
                "download task {} has unreadable metadata: {}",
                row.id, e
            )))
        })?;

        Ok(DownloadTask {
            id: TaskId(row.id),
            of_account_id: AccountId(row.of_account_id),
            download_type,
            url: row.url,
            download_status,
            metadata,
            attempt: row.attempt,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        })
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Outbox record from database
#[derive(Debug, Clone, FromRow)]
pub struct OutboxEvent {
    /// Monotonic id; relay order
    pub id: i64,
    /// Destination topic
    pub topic: String,
    /// Serialized message body
    pub payload: String,
    /// Unix timestamp when the event was written
    pub created_at: i64,
    /// Unix timestamp when the relay published the event
    pub delivered_at: Option<i64>,
}

/// Database handle for url-dl
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    lock_retry: RetryConfig,
}

/// A store transaction
///
/// Every task-store operation is available on a `StoreTx` so that several mutations
/// (and outbox writes) commit atomically. Dropping it without [`StoreTx::commit`]
/// rolls back and releases any row lock it holds.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Commit the transaction, releasing any lock it holds
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit transaction: {}",
                e
            )))
        })
    }

    /// Roll back the transaction explicitly
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to roll back transaction: {}",
                e
            )))
        })
    }
}

/// Whether a SQLite failure means another connection holds the write lock
///
/// Extended result codes: SQLITE_BUSY (5) and its variants 261/517/773,
/// SQLITE_LOCKED (6) and 262.
pub(crate) fn is_lock_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => {
            matches!(
                db_error.code().as_deref(),
                Some("5" | "6" | "261" | "262" | "517" | "773")
            ) || db_error.message().contains("database is locked")
        }
        _ => false,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
