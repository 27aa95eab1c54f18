use crate::config::{PersistenceConfig, RetryConfig};
use crate::db::*;
use crate::types::{AccountId, DownloadType};
use std::time::Duration;
use tempfile::TempDir;

mod outbox;

/// Open a fresh database in a temporary directory
async fn open_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("tasks.db")).await.unwrap();
    (db, temp_dir)
}

/// Open a fresh database with a short lock wait and the given number of lock retries
async fn open_contended_db(lock_wait: Duration, retries: u32) -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = PersistenceConfig {
        database_path: temp_dir.path().join("tasks.db"),
        lock_wait_timeout: lock_wait,
        lock_retry: RetryConfig {
            max_attempts: retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    };
    let db = Database::open(&config).await.unwrap();
    (db, temp_dir)
}

fn http_task(account: i64, url: &str) -> NewDownloadTask {
    NewDownloadTask {
        of_account_id: AccountId(account),
        download_type: DownloadType::Http,
        url: url.to_string(),
    }
}
