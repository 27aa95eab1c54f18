//! Execution engine
//!
//! Drives one task through `Pending → Downloading → {Success, Failed}`.
//!
//! The row lock is held only for the two short bookkeeping sections around the
//! transfer. Each execution claims a new `attempt` number when it moves the task
//! to Downloading and refreshes the row's `updated_at` while the transfer runs,
//! so the reset job can tell a live transfer from one whose process died.
//!
//! The final write only happens if the row still carries the claimed number. A
//! row that recovery reset to Pending but nobody has claimed again still takes
//! the result; once another execution claims it, the older result is dropped.

use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::downloader::DownloaderFactory;
use crate::mq::{Message, decode_task_created};
use crate::storage::{BlobSink, BlobStore, blob_key};
use crate::types::{DownloadStatus, DownloadTask, Metadata, TaskId};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Metadata key holding the failure message of the last attempt
pub const METADATA_ERROR: &str = "error";

/// What a call to [`ExecutionEngine::execute_download_task`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The task no longer exists
    Missing,
    /// The task was not Pending; nothing was done
    Skipped(DownloadStatus),
    /// Content stored and the task marked Success
    Succeeded,
    /// The transfer failed and the task was marked Failed
    Failed,
    /// Another attempt claimed the task, or it was deleted, while this attempt
    /// was transferring; its result was discarded
    Superseded,
}

enum Claim {
    Claimed(DownloadTask),
    Missing,
    NotPending(DownloadStatus),
}

/// Executes download tasks
pub struct ExecutionEngine {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    downloaders: Arc<dyn DownloaderFactory>,
    heartbeat_interval: Duration,
}

impl ExecutionEngine {
    /// Create an engine over the task store, blob store and downloader factory
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        downloaders: Arc<dyn DownloaderFactory>,
    ) -> Self {
        Self {
            db,
            blobs,
            downloaders,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Refresh a running task's row this often (default: 30 seconds)
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.heartbeat_interval = interval;
        }
        self
    }

    /// Execute task `id` if it is Pending
    ///
    /// Safe to call any number of times for the same task, concurrently or not:
    /// only the caller that finds the task Pending under the row lock runs it.
    /// Transfer failures are recorded on the task and reported as
    /// [`ExecutionOutcome::Failed`]; only store and lock failures are returned as
    /// errors.
    pub async fn execute_download_task(&self, id: TaskId) -> Result<ExecutionOutcome> {
        let task = match self.begin_attempt(id).await? {
            Claim::Claimed(task) => task,
            Claim::Missing => return Ok(ExecutionOutcome::Missing),
            Claim::NotPending(status) => return Ok(ExecutionOutcome::Skipped(status)),
        };

        tracing::info!(task_id = %id, attempt = task.attempt, url = %task.url, "Download started");

        let (sink, fetched) = self.fetch(&task).await;

        self.finish_attempt(&task, sink, fetched).await
    }

    /// Decode a task-created message and execute its task
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let event = decode_task_created(&message.payload)?;
        let outcome = self.execute_download_task(event.id).await?;
        tracing::debug!(task_id = %event.id, offset = message.offset, ?outcome, "Task created event handled");
        Ok(())
    }

    /// Claim the task under the lock: Pending → Downloading with a new attempt number
    async fn begin_attempt(&self, id: TaskId) -> Result<Claim> {
        let (mut tx, mut task) = match self.db.lock_task(id).await {
            Ok(locked) => locked,
            Err(Error::NotFound(_)) => {
                tracing::debug!(task_id = %id, "Task no longer exists, nothing to execute");
                return Ok(Claim::Missing);
            }
            Err(e) => return Err(e),
        };

        if !task
            .download_status
            .can_transition_to(DownloadStatus::Downloading)
        {
            tracing::debug!(task_id = %id, status = %task.download_status, "Task is not pending, skipping");
            tx.rollback().await?;
            return Ok(Claim::NotPending(task.download_status));
        }

        task.download_status = DownloadStatus::Downloading;
        task.attempt += 1;
        tx.update_task(&task).await?;
        tx.commit().await?;

        Ok(Claim::Claimed(task))
    }

    /// Stream the task's content into a staged blob
    ///
    /// The sink is handed back whether or not the transfer worked so the caller
    /// can commit or discard it.
    async fn fetch(&self, task: &DownloadTask) -> (Option<Box<dyn BlobSink>>, Result<Metadata>) {
        let downloader = match self.downloaders.downloader_for(task) {
            Ok(downloader) => downloader,
            Err(e) => return (None, Err(e)),
        };

        let mut sink = match self.blobs.open_for_write(&blob_key(task.id)).await {
            Ok(sink) => sink,
            Err(e) => return (None, Err(e)),
        };

        let result = {
            let transfer = downloader.download(&mut sink);
            tokio::pin!(transfer);

            let mut heartbeat = tokio::time::interval_at(
                Instant::now() + self.heartbeat_interval,
                self.heartbeat_interval,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut transfer => break result,
                    _ = heartbeat.tick() => self.heartbeat(task).await,
                }
            }
        };
        (Some(sink), result)
    }

    async fn heartbeat(&self, task: &DownloadTask) {
        match self.db.touch_task(task.id, task.attempt).await {
            Ok(true) => tracing::trace!(task_id = %task.id, attempt = task.attempt, "Download heartbeat"),
            Ok(false) => {
                tracing::debug!(task_id = %task.id, attempt = task.attempt, "Task moved on during download")
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to refresh running task")
            }
        }
    }

    /// Record the attempt's outcome, unless a newer attempt has claimed the task
    async fn finish_attempt(
        &self,
        attempt: &DownloadTask,
        sink: Option<Box<dyn BlobSink>>,
        fetched: Result<Metadata>,
    ) -> Result<ExecutionOutcome> {
        let id = attempt.id;
        let next = if fetched.is_ok() {
            DownloadStatus::Success
        } else {
            DownloadStatus::Failed
        };

        let (mut tx, mut current) = match self.db.lock_task(id).await {
            Ok(locked) => locked,
            Err(Error::NotFound(_)) => {
                discard(id, sink).await;
                tracing::info!(task_id = %id, "Task deleted during download, result discarded");
                return Ok(ExecutionOutcome::Superseded);
            }
            Err(e) => {
                discard(id, sink).await;
                return Err(e);
            }
        };

        // Reset to Pending but not claimed again: Pending -> Downloading -> next
        let unclaimed = current.download_status == DownloadStatus::Pending
            && current.url == attempt.url
            && current.download_type == attempt.download_type;
        let owned = current.attempt == attempt.attempt
            && (unclaimed || current.download_status.can_transition_to(next));

        if !owned {
            tx.rollback().await?;
            discard(id, sink).await;
            tracing::info!(
                task_id = %id,
                attempt = attempt.attempt,
                current_attempt = current.attempt,
                status = %current.download_status,
                "Attempt superseded, result discarded"
            );
            return Ok(ExecutionOutcome::Superseded);
        }

        let stored = match (fetched, sink) {
            (Ok(metadata), Some(sink)) => sink.commit().await.map(|_| metadata),
            (Ok(_), None) => Err(Error::Other("download finished without a sink".into())),
            (Err(e), sink) => {
                discard(id, sink).await;
                Err(e)
            }
        };

        let outcome = match stored {
            Ok(metadata) => {
                current.metadata.remove(METADATA_ERROR);
                current.metadata.extend(metadata);
                current.download_status = DownloadStatus::Success;
                tracing::info!(task_id = %id, attempt = current.attempt, "Download succeeded");
                ExecutionOutcome::Succeeded
            }
            Err(e) => {
                current
                    .metadata
                    .insert(METADATA_ERROR.to_string(), e.to_string().into());
                current.download_status = DownloadStatus::Failed;
                tracing::warn!(task_id = %id, attempt = current.attempt, error = %e, "Download failed");
                ExecutionOutcome::Failed
            }
        };

        tx.update_task(&current).await?;
        tx.commit().await?;

        Ok(outcome)
    }
}

async fn discard(id: TaskId, sink: Option<Box<dyn BlobSink>>) {
    if let Some(sink) = sink
        && let Err(e) = sink.abort().await
    {
        tracing::warn!(task_id = %id, error = %e, "Failed to discard staged content");
    }
}

#[async_trait]
impl Dispatcher for ExecutionEngine {
    async fn dispatch(&self, task_id: TaskId) -> Result<()> {
        self.execute_download_task(task_id).await.map(|_| ())
    }
}
