//! Common test utilities for url-dl integration tests

// Each test binary uses a different subset
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use url_dl::config::StaticTokenConfig;
use url_dl::{AccountId, Config, Database, DownloadStatus, DownloadTask, TaskId};

pub const ALICE_TOKEN: &str = "alice-token";
pub const ALICE: AccountId = AccountId(1);

/// Config with every path under `dir`, short intervals and an ephemeral API port
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("tasks.db");
    config.persistence.lock_retry.initial_delay = Duration::from_millis(10);
    config.storage.download_dir = dir.join("blobs");
    config.mq.broker_path = dir.join("mq.db");
    config.mq.poll_interval = Duration::from_millis(20);
    config.mq.relay_interval = Duration::from_millis(20);
    config.api.enabled = true;
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    config.auth.tokens = vec![StaticTokenConfig {
        token: ALICE_TOKEN.to_string(),
        account_id: ALICE,
        expires_at: None,
    }];
    config
}

/// Poll the store until the task reaches `status`, panicking after `timeout`
pub async fn wait_for_status(
    db: &Database,
    id: TaskId,
    status: DownloadStatus,
    timeout: Duration,
) -> DownloadTask {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = db.get_task(id).await.unwrap();
        if task.download_status == status {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {} stuck in {} waiting for {}",
                id, task.download_status, status
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Force a task into `status` the way a crashed or failed run leaves it
pub async fn force_status(db: &Database, id: TaskId, status: DownloadStatus) {
    let (mut tx, mut task) = db.lock_task(id).await.unwrap();
    task.download_status = status;
    tx.update_task(&task).await.unwrap();
    tx.commit().await.unwrap();
}
