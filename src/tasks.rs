//! Download task use cases
//!
//! The operations behind the REST API. Every call is made on behalf of an
//! account and only ever sees that account's tasks; a task owned by someone
//! else is reported as not found.

use crate::db::{Database, NewDownloadTask};
use crate::mq::encode_task_created;
use crate::storage::{BlobReader, BlobStore, blob_key};
use crate::types::{AccountId, DownloadStatus, DownloadTask, DownloadType, TaskCreatedEvent, TaskId};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One page of an account's tasks
#[derive(Clone, Debug, PartialEq)]
pub struct DownloadTaskPage {
    /// Tasks on this page, by id
    pub tasks: Vec<DownloadTask>,
    /// Number of tasks the account owns in total
    pub total_count: u64,
}

/// Stored content of a finished task
pub struct DownloadTaskFile {
    /// The task the content belongs to
    pub task: DownloadTask,
    /// Content size in bytes
    pub size: u64,
    /// Content stream
    pub reader: BlobReader,
}

/// Create, query, change and remove download tasks
pub struct DownloadTaskService {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    topic: String,
    relay_wake: Arc<Notify>,
    max_page_size: usize,
    shutdown: CancellationToken,
}

impl DownloadTaskService {
    /// Create the service
    ///
    /// New tasks are announced on `topic` through the outbox; `relay_wake` is
    /// signalled after each creation so the relay does not wait for its interval.
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        topic: impl Into<String>,
        relay_wake: Arc<Notify>,
        max_page_size: usize,
    ) -> Self {
        Self {
            db,
            blobs,
            topic: topic.into(),
            relay_wake,
            max_page_size: max_page_size.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reject changes with [`Error::ShuttingDown`] once `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Create a Pending task and schedule its execution
    ///
    /// The task row and its task-created event are committed together, so a
    /// task is never created without being dispatched (or vice versa).
    pub async fn create_download_task(
        &self,
        account: AccountId,
        download_type: DownloadType,
        url: &str,
    ) -> Result<DownloadTask> {
        self.ensure_accepting()?;
        if download_type == DownloadType::Unspecified {
            return Err(Error::Validation("download_type must be specified".into()));
        }
        let url = validate_url(url)?;

        let mut tx = self.db.begin().await?;
        let id = tx
            .create_task(&NewDownloadTask {
                of_account_id: account,
                download_type,
                url,
            })
            .await?;
        let payload = encode_task_created(&TaskCreatedEvent { id })?;
        tx.enqueue_outbox_event(&self.topic, &payload).await?;
        let task = tx.get_task(id).await?;
        tx.commit().await?;

        self.relay_wake.notify_one();
        tracing::info!(task_id = %id, account_id = %account, url = %task.url, "Download task created");
        Ok(task)
    }

    /// List the account's tasks by id
    ///
    /// `limit` is clamped to `1..=max_page_size`.
    pub async fn get_download_task_list(
        &self,
        account: AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<DownloadTaskPage> {
        let limit = limit.clamp(1, self.max_page_size as u64);

        let tasks = self
            .db
            .list_tasks_of_account(account, offset, limit)
            .await?;
        let total_count = self.db.count_tasks_of_account(account).await?;

        Ok(DownloadTaskPage { tasks, total_count })
    }

    /// Get one of the account's tasks
    pub async fn get_download_task(&self, account: AccountId, id: TaskId) -> Result<DownloadTask> {
        let task = match self.db.get_task(id).await {
            Ok(task) => task,
            Err(Error::NotFound(_)) => return Err(not_found(id)),
            Err(e) => return Err(e),
        };
        if task.of_account_id != account {
            return Err(not_found(id));
        }
        Ok(task)
    }

    /// Change the URL of a task that has not started executing
    pub async fn update_download_task(
        &self,
        account: AccountId,
        id: TaskId,
        url: &str,
    ) -> Result<DownloadTask> {
        self.ensure_accepting()?;
        let url = validate_url(url)?;

        let (mut tx, mut task) = self.lock_owned(account, id).await?;
        if task.download_status != DownloadStatus::Pending {
            tx.rollback().await?;
            return Err(Error::Conflict(format!(
                "download task {} is {}; the url can only change while pending",
                id, task.download_status
            )));
        }

        task.url = url;
        tx.update_task(&task).await?;
        let task = tx.get_task(id).await?;
        tx.commit().await?;

        tracing::info!(task_id = %id, url = %task.url, "Download task url updated");
        Ok(task)
    }

    /// Delete a task and its stored content
    pub async fn delete_download_task(&self, account: AccountId, id: TaskId) -> Result<()> {
        self.ensure_accepting()?;
        let (mut tx, _) = self.lock_owned(account, id).await?;
        tx.delete_task(id).await?;
        tx.commit().await?;

        if let Err(e) = self.blobs.remove(&blob_key(id)).await {
            tracing::warn!(task_id = %id, error = %e, "Task deleted but its content could not be removed");
        }

        tracing::info!(task_id = %id, "Download task deleted");
        Ok(())
    }

    /// Open the stored content of a finished task
    pub async fn open_download_task_file(
        &self,
        account: AccountId,
        id: TaskId,
    ) -> Result<DownloadTaskFile> {
        let task = self.get_download_task(account, id).await?;
        if task.download_status != DownloadStatus::Success {
            return Err(Error::Conflict(format!(
                "download task {} is {}; content is only available after success",
                id, task.download_status
            )));
        }

        let (reader, size) = self.blobs.open_for_read(&blob_key(id)).await?;
        Ok(DownloadTaskFile { task, size, reader })
    }

    async fn lock_owned(
        &self,
        account: AccountId,
        id: TaskId,
    ) -> Result<(crate::db::StoreTx, DownloadTask)> {
        let (tx, task) = match self.db.lock_task(id).await {
            Ok(locked) => locked,
            Err(Error::NotFound(_)) => return Err(not_found(id)),
            Err(e) => return Err(e),
        };
        if task.of_account_id != account {
            tx.rollback().await?;
            return Err(not_found(id));
        }
        Ok((tx, task))
    }
}

fn not_found(id: TaskId) -> Error {
    Error::NotFound(format!("download task {}", id))
}

/// Accept absolute http(s) URLs with a host
fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("url must not be empty".into()));
    }

    let parsed = url::Url::parse(trimmed)
        .map_err(|e| Error::Validation(format!("invalid url '{}': {}", trimmed, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "url must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::Validation("url must have a host".into()));
    }

    Ok(trimmed.to_string())
}
