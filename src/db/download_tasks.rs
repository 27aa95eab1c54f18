//! Download task CRUD and the exclusive row lock.
//!
//! The query functions take a bare connection so they run the same way on a pooled
//! connection ([`Database`]) and inside a transaction ([`StoreTx`]).

use crate::error::DatabaseError;
use crate::retry::retry_with_backoff;
use crate::types::{AccountId, DownloadStatus, DownloadTask, TaskId};
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{Database, DownloadTaskRow, NewDownloadTask, StoreTx, is_lock_contention};

const TASK_COLUMNS: &str = "id, of_account_id, download_type, url, download_status, metadata, attempt, created_at, updated_at";

fn not_found(id: TaskId) -> Error {
    Error::NotFound(format!("download task {}", id))
}

async fn insert_task(conn: &mut SqliteConnection, task: &NewDownloadTask) -> Result<TaskId> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO download_tasks (
            of_account_id, download_type, url, download_status, metadata,
            attempt, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, '{}', 0, ?, ?)
        "#,
    )
    .bind(task.of_account_id)
    .bind(task.download_type.to_i32())
    .bind(&task.url)
    .bind(DownloadStatus::Pending.to_i32())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to insert download task: {}",
            e
        )))
    })?;

    Ok(TaskId(result.last_insert_rowid()))
}

async fn fetch_task(conn: &mut SqliteConnection, id: TaskId) -> Result<Option<DownloadTask>> {
    let row = sqlx::query_as::<_, DownloadTaskRow>(&format!(
        "SELECT {} FROM download_tasks WHERE id = ?",
        TASK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to get download task: {}",
            e
        )))
    })?;

    row.map(DownloadTask::try_from).transpose()
}

async fn lock_row(conn: &mut SqliteConnection, id: TaskId) -> Result<DownloadTask> {
    // A no-op write takes the database write lock for the rest of the transaction.
    let claimed = sqlx::query("UPDATE download_tasks SET updated_at = updated_at WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_lock_contention(&e) {
                Error::LockTimeout { task_id: id }
            } else {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to lock download task {}: {}",
                    id, e
                )))
            }
        })?;

    if claimed.rows_affected() == 0 {
        return Err(not_found(id));
    }

    fetch_task(conn, id).await?.ok_or_else(|| not_found(id))
}

async fn update_task(conn: &mut SqliteConnection, task: &DownloadTask) -> Result<()> {
    let metadata = serde_json::to_string(&task.metadata)?;

    let result = sqlx::query(
        r#"
        UPDATE download_tasks
        SET download_type = ?, url = ?, download_status = ?, metadata = ?,
            attempt = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(task.download_type.to_i32())
    .bind(&task.url)
    .bind(task.download_status.to_i32())
    .bind(metadata)
    .bind(task.attempt)
    .bind(chrono::Utc::now().timestamp())
    .bind(task.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to update download task: {}",
            e
        )))
    })?;

    if result.rows_affected() == 0 {
        return Err(not_found(task.id));
    }

    Ok(())
}

async fn touch_task(conn: &mut SqliteConnection, id: TaskId, attempt: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE download_tasks SET updated_at = ? WHERE id = ? AND attempt = ? AND download_status = ?",
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .bind(attempt)
    .bind(DownloadStatus::Downloading.to_i32())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_lock_contention(&e) {
            Error::LockTimeout { task_id: id }
        } else {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to touch download task: {}",
                e
            )))
        }
    })?;

    Ok(result.rows_affected() > 0)
}

async fn delete_task(conn: &mut SqliteConnection, id: TaskId) -> Result<()> {
    let result = sqlx::query("DELETE FROM download_tasks WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to delete download task: {}",
                e
            )))
        })?;

    if result.rows_affected() == 0 {
        return Err(not_found(id));
    }

    Ok(())
}

async fn list_tasks_of_account(
    conn: &mut SqliteConnection,
    account_id: AccountId,
    offset: u64,
    limit: u64,
) -> Result<Vec<DownloadTask>> {
    let rows = sqlx::query_as::<_, DownloadTaskRow>(&format!(
        "SELECT {} FROM download_tasks WHERE of_account_id = ? ORDER BY id ASC LIMIT ? OFFSET ?",
        TASK_COLUMNS
    ))
    .bind(account_id)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .bind(i64::try_from(offset).unwrap_or(i64::MAX))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to list download tasks: {}",
            e
        )))
    })?;

    rows.into_iter().map(DownloadTask::try_from).collect()
}

async fn count_tasks_of_account(conn: &mut SqliteConnection, account_id: AccountId) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM download_tasks WHERE of_account_id = ?")
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count download tasks: {}",
                e
            )))
        })?;

    Ok(count.max(0) as u64)
}

async fn list_tasks_with_status(
    conn: &mut SqliteConnection,
    statuses: &[DownloadStatus],
    after: Option<TaskId>,
    limit: usize,
) -> Result<Vec<DownloadTask>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM download_tasks WHERE download_status IN ({}) AND id > ? ORDER BY id ASC LIMIT ?",
        TASK_COLUMNS, placeholders
    );

    let mut query = sqlx::query_as::<_, DownloadTaskRow>(&sql);
    for status in statuses {
        query = query.bind(status.to_i32());
    }

    let rows = query
        .bind(after.map(|id| id.get()).unwrap_or(0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to scan download tasks by status: {}",
                e
            )))
        })?;

    rows.into_iter().map(DownloadTask::try_from).collect()
}

impl Database {
    /// Begin a store transaction
    pub async fn begin(&self) -> Result<StoreTx> {
        let tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        Ok(StoreTx { tx })
    }

    /// Open a transaction holding the exclusive lock on task `id`
    ///
    /// Lock waits that exceed the configured bound are retried with backoff; once the
    /// retries are used up the call fails with [`Error::LockTimeout`]. A missing row
    /// fails with [`Error::NotFound`] without retrying.
    pub async fn lock_task(&self, id: TaskId) -> Result<(StoreTx, DownloadTask)> {
        retry_with_backoff(&self.lock_retry, || async move {
            let mut tx = self.begin().await?;
            let task = tx.get_task_with_exclusive_lock(id).await?;
            Ok((tx, task))
        })
        .await
    }

    /// Insert a new Pending task in its own transaction
    pub async fn create_task(&self, task: &NewDownloadTask) -> Result<TaskId> {
        let mut tx = self.begin().await?;
        let id = tx.create_task(task).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Get a task by id
    pub async fn get_task(&self, id: TaskId) -> Result<DownloadTask> {
        let mut conn = self.acquire().await?;
        fetch_task(&mut conn, id).await?.ok_or_else(|| not_found(id))
    }

    /// Overwrite a task's mutable columns (outside any lock)
    pub async fn update_task(&self, task: &DownloadTask) -> Result<()> {
        let mut conn = self.acquire().await?;
        update_task(&mut conn, task).await
    }

    /// Refresh `updated_at` of a task still Downloading under `attempt`
    ///
    /// A single statement, so it never waits on the row lock longer than the
    /// configured bound. Returns `false` when the row has moved on.
    pub async fn touch_task(&self, id: TaskId, attempt: i64) -> Result<bool> {
        let mut conn = self.acquire().await?;
        touch_task(&mut conn, id, attempt).await
    }

    /// Delete a task (outside any lock)
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        let mut conn = self.acquire().await?;
        delete_task(&mut conn, id).await
    }

    /// List an account's tasks ordered by id
    pub async fn list_tasks_of_account(
        &self,
        account_id: AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DownloadTask>> {
        let mut conn = self.acquire().await?;
        list_tasks_of_account(&mut conn, account_id, offset, limit).await
    }

    /// Count an account's tasks
    pub async fn count_tasks_of_account(&self, account_id: AccountId) -> Result<u64> {
        let mut conn = self.acquire().await?;
        count_tasks_of_account(&mut conn, account_id).await
    }

    /// Keyset page of tasks whose status is one of `statuses`, ids strictly after `after`
    pub async fn list_tasks_with_status(
        &self,
        statuses: &[DownloadStatus],
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<DownloadTask>> {
        let mut conn = self.acquire().await?;
        list_tasks_with_status(&mut conn, statuses, after, limit).await
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })
    }
}

impl StoreTx {
    /// Insert a new Pending task with empty metadata
    pub async fn create_task(&mut self, task: &NewDownloadTask) -> Result<TaskId> {
        insert_task(&mut self.tx, task).await
    }

    /// Read a task without locking it
    pub async fn get_task(&mut self, id: TaskId) -> Result<DownloadTask> {
        fetch_task(&mut self.tx, id).await?.ok_or_else(|| not_found(id))
    }

    /// Read a task and hold its exclusive lock until this transaction ends
    ///
    /// Blocks while another transaction holds the lock, up to the configured wait
    /// bound, then fails with [`Error::LockTimeout`]. Does not retry.
    pub async fn get_task_with_exclusive_lock(&mut self, id: TaskId) -> Result<DownloadTask> {
        lock_row(&mut self.tx, id).await
    }

    /// Overwrite a task's mutable columns
    pub async fn update_task(&mut self, task: &DownloadTask) -> Result<()> {
        update_task(&mut self.tx, task).await
    }

    /// Delete a task
    pub async fn delete_task(&mut self, id: TaskId) -> Result<()> {
        delete_task(&mut self.tx, id).await
    }

    /// List an account's tasks ordered by id
    pub async fn list_tasks_of_account(
        &mut self,
        account_id: AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DownloadTask>> {
        list_tasks_of_account(&mut self.tx, account_id, offset, limit).await
    }

    /// Count an account's tasks
    pub async fn count_tasks_of_account(&mut self, account_id: AccountId) -> Result<u64> {
        count_tasks_of_account(&mut self.tx, account_id).await
    }
}
