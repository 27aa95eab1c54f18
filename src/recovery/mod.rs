//! Recovery jobs
//!
//! Two periodic scans that make the system converge after crashes, lost
//! messages and failed transfers:
//!
//! - [`ExecuteAllPendingDownloadTask`] re-dispatches every Pending task.
//! - [`UpdateDownloadingAndFailedDownloadTaskStatusToPending`] resets Failed
//!   tasks, and Downloading tasks whose transfer stopped refreshing the row,
//!   back to Pending so the pending scan picks them up.
//!
//! Both scans page through the store by id and handle each task on its own;
//! one task's error is logged and the scan moves on.

use crate::config::RecoveryConfig;
use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::types::{DownloadStatus, DownloadTask, TaskId};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Totals of one job run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks the scan looked at
    pub scanned: usize,
    /// Tasks acted upon (dispatched or reset)
    pub processed: usize,
    /// Tasks whose handling failed
    pub failed: usize,
}

/// A periodic recovery job
#[async_trait]
pub trait RecoveryJob: Send + Sync {
    /// Stable job name used in logs and schedule registration
    fn name(&self) -> &'static str;

    /// Run one full scan
    ///
    /// Errors are returned only when the scan itself cannot proceed; per-task
    /// failures are counted in the report.
    async fn run(&self) -> Result<RecoveryReport>;
}

/// Calls `handle` for every task in `statuses`, page by page in id order
async fn scan<F, Fut>(
    db: &Database,
    statuses: &[DownloadStatus],
    page_size: usize,
    job: &'static str,
    mut handle: F,
) -> Result<RecoveryReport>
where
    F: FnMut(DownloadTask) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let mut report = RecoveryReport::default();
    let mut after: Option<TaskId> = None;

    loop {
        let page = db.list_tasks_with_status(statuses, after, page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id);
        let page_len = page.len();

        for task in page {
            let id = task.id;
            report.scanned += 1;
            match handle(task).await {
                Ok(true) => report.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(job, task_id = %id, error = %e, "Recovery failed for task");
                }
            }
        }

        if page_len < page_size {
            break;
        }
    }

    Ok(report)
}

/// Re-dispatches every Pending task
pub struct ExecuteAllPendingDownloadTask {
    db: Database,
    dispatcher: Arc<dyn Dispatcher>,
    page_size: usize,
}

impl ExecuteAllPendingDownloadTask {
    /// Job name
    pub const NAME: &'static str = "execute_all_pending_download_task";

    /// Create the job dispatching through `dispatcher`
    pub fn new(db: Database, dispatcher: Arc<dyn Dispatcher>, config: &RecoveryConfig) -> Self {
        Self {
            db,
            dispatcher,
            page_size: config.page_size.max(1),
        }
    }
}

#[async_trait]
impl RecoveryJob for ExecuteAllPendingDownloadTask {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self) -> Result<RecoveryReport> {
        let report = scan(
            &self.db,
            &[DownloadStatus::Pending],
            self.page_size,
            Self::NAME,
            |task| async move {
                self.dispatcher.dispatch(task.id).await?;
                Ok(true)
            },
        )
        .await?;

        if report.scanned > 0 {
            tracing::info!(
                dispatched = report.processed,
                failed = report.failed,
                "Pending tasks re-dispatched"
            );
        }
        Ok(report)
    }
}

/// Resets stuck Downloading and Failed tasks to Pending
///
/// A Downloading task counts as stuck once its `updated_at` is older than
/// `stuck_after`; running transfers keep refreshing it.
pub struct UpdateDownloadingAndFailedDownloadTaskStatusToPending {
    db: Database,
    page_size: usize,
    max_attempts: Option<u32>,
    stuck_after: Duration,
}

impl UpdateDownloadingAndFailedDownloadTaskStatusToPending {
    /// Job name
    pub const NAME: &'static str = "update_downloading_and_failed_download_task_status_to_pending";

    /// Create the job
    pub fn new(db: Database, config: &RecoveryConfig) -> Self {
        Self {
            db,
            page_size: config.page_size.max(1),
            max_attempts: config.max_attempts,
            stuck_after: config.stuck_after,
        }
    }

    /// Treat every Downloading task as stuck, for the pass run before any
    /// execution of this process has started
    pub fn on_startup(mut self) -> Self {
        self.stuck_after = Duration::ZERO;
        self
    }

    fn is_stuck(&self, task: &DownloadTask) -> bool {
        if self.stuck_after.is_zero() {
            return true;
        }
        (Utc::now() - task.updated_at)
            .to_std()
            .is_ok_and(|idle| idle >= self.stuck_after)
    }

    /// Reset one task under its row lock; `false` when it no longer qualifies
    async fn reset(&self, id: TaskId) -> Result<bool> {
        let (mut tx, mut task) = match self.db.lock_task(id).await {
            Ok(locked) => locked,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        // The scan read the row without the lock; it may have moved on since
        if !task.download_status.can_transition_to(DownloadStatus::Pending) {
            tx.rollback().await?;
            return Ok(false);
        }

        if task.download_status == DownloadStatus::Downloading && !self.is_stuck(&task) {
            tx.rollback().await?;
            tracing::trace!(task_id = %id, attempt = task.attempt, "Download still running, leaving it");
            return Ok(false);
        }

        if task.download_status == DownloadStatus::Failed
            && let Some(max) = self.max_attempts
            && task.attempt >= i64::from(max)
        {
            tx.rollback().await?;
            tracing::debug!(task_id = %id, attempt = task.attempt, "Task reached the attempt limit, leaving it failed");
            return Ok(false);
        }

        let previous = task.download_status;
        task.download_status = DownloadStatus::Pending;
        tx.update_task(&task).await?;
        tx.commit().await?;

        tracing::debug!(task_id = %id, from = %previous, "Task reset to pending");
        Ok(true)
    }
}

#[async_trait]
impl RecoveryJob for UpdateDownloadingAndFailedDownloadTaskStatusToPending {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self) -> Result<RecoveryReport> {
        let report = scan(
            &self.db,
            &[DownloadStatus::Downloading, DownloadStatus::Failed],
            self.page_size,
            Self::NAME,
            |task| self.reset(task.id),
        )
        .await?;

        if report.processed > 0 || report.failed > 0 {
            tracing::info!(
                reset = report.processed,
                failed = report.failed,
                "Stuck and failed tasks reset to pending"
            );
        }
        Ok(report)
    }
}
