//! Shared fixtures for unit tests.

use crate::config::Config;
use crate::db::{Database, NewDownloadTask};
use crate::downloader::DefaultDownloaderFactory;
use crate::engine::ExecutionEngine;
use crate::mq::SqliteBroker;
use crate::storage::{BlobStore, LocalBlobStore, blob_key};
use crate::types::{AccountId, DownloadStatus, DownloadTask, DownloadType, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::io::AsyncReadExt;

/// Task store, blob store and broker rooted in one temporary directory.
/// The directory lives as long as the value.
pub(crate) struct TestEnv {
    pub config: Config,
    pub db: Database,
    pub blobs: Arc<LocalBlobStore>,
    pub broker: SqliteBroker,
    pub dir: TempDir,
}

/// Config pointing every path into `dir`, with short poll intervals
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("tasks.db");
    config.persistence.lock_retry.initial_delay = Duration::from_millis(10);
    config.storage.download_dir = dir.join("blobs");
    config.mq.broker_path = dir.join("mq.db");
    config.mq.poll_interval = Duration::from_millis(20);
    config.mq.relay_interval = Duration::from_millis(20);
    config.api.enabled = false;
    config
}

pub(crate) async fn test_env() -> TestEnv {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let db = Database::open(&config.persistence).await.unwrap();
    let blobs = Arc::new(
        LocalBlobStore::new(&config.storage.download_dir)
            .await
            .unwrap(),
    );
    let broker = SqliteBroker::open(&config.mq.broker_path).await.unwrap();

    TestEnv {
        config,
        db,
        blobs,
        broker,
        dir,
    }
}

impl TestEnv {
    /// Engine using the real HTTP downloader
    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine_with_heartbeat(self.config.recovery.heartbeat_interval)
    }

    pub fn engine_with_heartbeat(&self, interval: Duration) -> Arc<ExecutionEngine> {
        let downloaders = DefaultDownloaderFactory::new(&self.config.download)
            .unwrap()
            .shared();
        Arc::new(
            ExecutionEngine::new(self.db.clone(), self.blobs.clone(), downloaders)
                .with_heartbeat_interval(interval),
        )
    }

    /// Make a task look untouched since the epoch
    pub async fn backdate(&self, id: TaskId) {
        sqlx::query("UPDATE download_tasks SET updated_at = 0 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .unwrap();
    }

    /// Insert a Pending HTTP task
    pub async fn pending_task(&self, account: i64, url: &str) -> TaskId {
        self.db
            .create_task(&NewDownloadTask {
                of_account_id: AccountId(account),
                download_type: DownloadType::Http,
                url: url.to_string(),
            })
            .await
            .unwrap()
    }

    /// Insert an HTTP task and force it into `status`
    pub async fn task_with_status(&self, url: &str, status: DownloadStatus) -> TaskId {
        let id = self.pending_task(1, url).await;
        self.set_status(id, status).await;
        id
    }

    /// Overwrite a task's status under the row lock
    pub async fn set_status(&self, id: TaskId, status: DownloadStatus) {
        let (mut tx, mut task) = self.db.lock_task(id).await.unwrap();
        task.download_status = status;
        tx.update_task(&task).await.unwrap();
        tx.commit().await.unwrap();
    }

    pub async fn task(&self, id: TaskId) -> DownloadTask {
        self.db.get_task(id).await.unwrap()
    }

    /// Committed blob content of a task, if any
    pub async fn blob(&self, id: TaskId) -> Option<Vec<u8>> {
        let (mut reader, _) = self.blobs.open_for_read(&blob_key(id)).await.ok()?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        Some(buf)
    }

    /// Poll until the task reaches `status`, panicking after 5 seconds
    pub async fn wait_for_status(&self, id: TaskId, status: DownloadStatus) {
        for _ in 0..500 {
            if self.task(id).await.download_status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}", id, status);
    }
}
