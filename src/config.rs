//! Configuration types for url-dl

use crate::error::{Error, Result};
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

/// Main configuration for url-dl
///
/// Every section has defaults, so an empty document is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Task store location and locking behavior
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Blob storage for downloaded content
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP downloader settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Message broker, consumer and outbox relay settings
    #[serde(default)]
    pub mq: MqConfig,

    /// Recovery job schedules
    #[serde(default)]
    pub cron: CronConfig,

    /// Recovery job behavior
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Bearer token table used by the built-in token resolver
    #[serde(default)]
    pub auth: AuthConfig,

    /// REST API server
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Check values that serde cannot validate on its own
    ///
    /// Cron expressions are parsed here so that a bad schedule fails before any
    /// background task is started.
    pub fn validate(&self) -> Result<()> {
        for (key, schedule) in [
            (
                "cron.execute_all_pending_download_task.schedule",
                &self.cron.execute_all_pending_download_task.schedule,
            ),
            (
                "cron.update_downloading_and_failed_download_task_status_to_pending.schedule",
                &self
                    .cron
                    .update_downloading_and_failed_download_task_status_to_pending
                    .schedule,
            ),
        ] {
            cron::Schedule::from_str(schedule).map_err(|e| Error::Config {
                message: format!("invalid cron expression '{}': {}", schedule, e),
                key: Some(key.to_string()),
            })?;
        }

        let non_zero = [
            ("recovery.page_size", self.recovery.page_size),
            ("mq.fetch_batch_size", self.mq.fetch_batch_size),
            ("mq.relay_batch_size", self.mq.relay_batch_size),
            ("api.max_page_size", self.api.max_page_size),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(Error::Config {
                    message: format!("{} must be greater than zero", key),
                    key: Some(key.to_string()),
                });
            }
        }

        if self.mq.topic.trim().is_empty() {
            return Err(Error::Config {
                message: "topic must not be empty".to_string(),
                key: Some("mq.topic".to_string()),
            });
        }

        if self.recovery.max_attempts == Some(0) {
            return Err(Error::Config {
                message: "max_attempts must be at least 1 when set".to_string(),
                key: Some("recovery.max_attempts".to_string()),
            });
        }

        if self.recovery.heartbeat_interval.is_zero()
            || self.recovery.heartbeat_interval >= self.recovery.stuck_after
        {
            return Err(Error::Config {
                message: "heartbeat_interval must be non-zero and shorter than stuck_after"
                    .to_string(),
                key: Some("recovery.heartbeat_interval".to_string()),
            });
        }

        Ok(())
    }
}

/// Task store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./url-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Longest a transaction waits for a task's row lock before failing with
    /// `LockTimeout` (default: 5000 ms)
    #[serde(default = "default_lock_wait_timeout", with = "duration_ms_serde")]
    pub lock_wait_timeout: Duration,

    /// Backoff applied when a lock wait times out (default: 3 retries, 100 ms doubling)
    #[serde(default = "default_lock_retry")]
    pub lock_retry: RetryConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            lock_wait_timeout: default_lock_wait_timeout(),
            lock_retry: default_lock_retry(),
        }
    }
}

/// Retry behavior with exponential backoff
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 100 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 2000 ms)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Blob storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one file per finished task (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

/// HTTP downloader configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// TCP/TLS connect timeout (default: 30 seconds)
    ///
    /// There is deliberately no overall request timeout; content length is unbounded.
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Message broker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MqConfig {
    /// Broker log database path (default: "./url-dl-mq.db")
    #[serde(default = "default_broker_path")]
    pub broker_path: PathBuf,

    /// Topic carrying task-created events (default: "download_task_created")
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group / client identifier used for committed offsets (default: "url-dl")
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Idle wait between empty fetches when no publish notification arrives (default: 1000 ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Messages fetched per round trip (default: 100)
    #[serde(default = "default_batch_size")]
    pub fetch_batch_size: usize,

    /// Idle wait of the outbox relay between scans (default: 1000 ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub relay_interval: Duration,

    /// Outbox rows relayed per scan (default: 100)
    #[serde(default = "default_batch_size")]
    pub relay_batch_size: usize,

    /// How long delivered outbox rows are kept (default: 86400 seconds)
    #[serde(default = "default_outbox_retention", with = "duration_serde")]
    pub outbox_retention: Duration,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            broker_path: default_broker_path(),
            topic: default_topic(),
            client_id: default_client_id(),
            poll_interval: default_poll_interval(),
            fetch_batch_size: default_batch_size(),
            relay_interval: default_poll_interval(),
            relay_batch_size: default_batch_size(),
            outbox_retention: default_outbox_retention(),
        }
    }
}

/// Cron schedules of the two recovery jobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronConfig {
    /// Re-dispatch every Pending task (default: every minute)
    #[serde(default = "default_pending_job")]
    pub execute_all_pending_download_task: CronJobConfig,

    /// Reset Downloading and Failed tasks to Pending (default: every five minutes)
    #[serde(default = "default_reset_job")]
    pub update_downloading_and_failed_download_task_status_to_pending: CronJobConfig,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            execute_all_pending_download_task: default_pending_job(),
            update_downloading_and_failed_download_task_status_to_pending: default_reset_job(),
        }
    }
}

/// A single cron job schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronJobConfig {
    /// Cron expression with a leading seconds field, e.g. `"0 */5 * * * *"`
    pub schedule: String,
}

/// How the pending scan re-enters the dispatch path
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedispatchMode {
    /// Write a task-created event to the outbox (default)
    #[default]
    Outbox,
    /// Run the execution engine in-process
    Direct,
}

/// Recovery job behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Rows read per page while scanning (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Stop resetting Failed tasks after this many execution attempts (default: unbounded)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Dispatch path used for Pending tasks
    #[serde(default)]
    pub redispatch: RedispatchMode,

    /// A Downloading task is reset only once its row has not been touched for
    /// this long, in seconds (default: 600)
    #[serde(default = "default_stuck_after", with = "duration_serde")]
    pub stuck_after: Duration,

    /// How often a running transfer refreshes its row, in seconds (default: 30)
    #[serde(default = "default_heartbeat_interval", with = "duration_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: None,
            redispatch: RedispatchMode::default(),
            stuck_after: default_stuck_after(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// Static bearer tokens
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens and the accounts they resolve to
    #[serde(default)]
    pub tokens: Vec<StaticTokenConfig>,
}

/// One accepted bearer token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticTokenConfig {
    /// The token value
    pub token: String,
    /// Account the token authenticates as
    pub account_id: AccountId,
    /// Optional expiry (RFC 3339); never expires when absent
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Start the API server (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind to (default: 127.0.0.1:8080)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Upper bound for the `limit` of list requests (default: 100)
    #[serde(default = "default_page_size")]
    pub max_page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            max_page_size: default_page_size(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./url-dl.db")
}

fn default_lock_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lock_retry() -> RetryConfig {
    RetryConfig::default()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_user_agent() -> String {
    format!("url-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_broker_path() -> PathBuf {
    PathBuf::from("./url-dl-mq.db")
}

fn default_topic() -> String {
    "download_task_created".to_string()
}

fn default_client_id() -> String {
    "url-dl".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    100
}

fn default_outbox_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_pending_job() -> CronJobConfig {
    CronJobConfig {
        schedule: "0 * * * * *".to_string(),
    }
}

fn default_reset_job() -> CronJobConfig {
    CronJobConfig {
        schedule: "0 */5 * * * *".to_string(),
    }
}

fn default_page_size() -> usize {
    100
}

fn default_stuck_after() -> Duration {
    Duration::from_secs(600)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
