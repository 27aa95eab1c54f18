//! SQLite-backed broker log.
//!
//! Lives in its own database file so it is a separate durable store from the
//! task database; the outbox relay is what bridges the two.

use crate::error::{BrokerError, DatabaseError};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Message, MessageBroker};

#[derive(FromRow)]
struct MessageRow {
    seq: i64,
    topic: String,
    payload: Vec<u8>,
    published_at: i64,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            offset: row.seq,
            topic: row.topic,
            payload: row.payload,
            published_at: row.published_at,
        }
    }
}

/// Broker log stored in a SQLite database
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    notify: Arc<Notify>,
}

impl SqliteBroker {
    /// Open (creating if needed) the broker log at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create broker directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse broker path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to broker database: {}",
                e
            )))
        })?;

        let broker = Self {
            pool,
            notify: Arc::new(Notify::new()),
        };
        broker.create_schema().await?;

        Ok(broker)
    }

    async fn create_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS mq_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                published_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_mq_messages_topic ON mq_messages(topic, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS mq_consumer_offsets (
                consumer_group TEXT NOT NULL,
                topic TEXT NOT NULL,
                committed_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (consumer_group, topic)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "Failed to create broker schema: {}",
                        e
                    )))
                })?;
        }

        Ok(())
    }

    /// Number of messages stored for `topic`
    pub async fn message_count(&self, topic: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM mq_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Broker(BrokerError::FetchFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            })
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO mq_messages (topic, payload, published_at) VALUES (?, ?, ?)",
        )
        .bind(topic)
        .bind(payload)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Broker(BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        })?;

        self.notify.notify_waiters();
        Ok(result.last_insert_rowid())
    }

    async fn fetch(&self, topic: &str, after: i64, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT seq, topic, payload, published_at
            FROM mq_messages
            WHERE topic = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Broker(BrokerError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn committed_offset(&self, group: &str, topic: &str) -> Result<i64> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT committed_offset FROM mq_consumer_offsets WHERE consumer_group = ? AND topic = ?",
        )
        .bind(group)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Broker(BrokerError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(offset.unwrap_or(0))
    }

    async fn commit_offset(&self, group: &str, topic: &str, offset: i64) -> Result<()> {
        // MAX keeps a late commit from moving the group backwards
        sqlx::query(
            r#"
            INSERT INTO mq_consumer_offsets (consumer_group, topic, committed_offset, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(consumer_group, topic) DO UPDATE SET
                committed_offset = MAX(committed_offset, excluded.committed_offset),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(offset)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Broker(BrokerError::CommitFailed {
                topic: topic.to_string(),
                offset,
                reason: e.to_string(),
            })
        })?;

        Ok(())
    }

    fn subscribe_notifications(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
