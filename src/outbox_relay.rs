//! Outbox relay
//!
//! Moves committed outbox rows onto the message broker. Rows are published in
//! id order and marked delivered one at a time; the first publish failure ends
//! the round so later rows never overtake an earlier one. A crash between
//! publish and mark re-publishes the row on the next round (at-least-once).

use crate::config::MqConfig;
use crate::db::Database;
use crate::mq::MessageBroker;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Publishes outbox rows to the broker
pub struct OutboxRelay {
    db: Database,
    broker: Arc<dyn MessageBroker>,
    wake: Arc<Notify>,
    batch_size: usize,
    interval: Duration,
    retention: Duration,
}

impl OutboxRelay {
    /// Create a relay from `config`
    pub fn new(db: Database, broker: Arc<dyn MessageBroker>, config: &MqConfig) -> Self {
        Self {
            db,
            broker,
            wake: Arc::new(Notify::new()),
            batch_size: config.relay_batch_size.max(1),
            interval: config.relay_interval,
            retention: config.outbox_retention,
        }
    }

    /// Handle that wakes the relay ahead of its interval
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Publish every undelivered row, returning how many were delivered
    ///
    /// Stops at the first failure and returns it; rows from that one onwards
    /// stay undelivered for the next round.
    pub async fn relay_pending(&self) -> Result<usize> {
        let mut delivered = 0;

        loop {
            let events = self
                .db
                .list_undelivered_outbox_events(self.batch_size)
                .await?;
            let batch_len = events.len();

            for event in events {
                let offset = self
                    .broker
                    .publish(&event.topic, event.payload.as_bytes())
                    .await?;
                self.db.mark_outbox_event_delivered(event.id).await?;
                tracing::debug!(outbox_id = event.id, offset, topic = %event.topic, "Outbox event relayed");
                delivered += 1;
            }

            if batch_len < self.batch_size {
                break;
            }
        }

        Ok(delivered)
    }

    /// Delete delivered rows older than the retention window
    pub async fn purge_delivered(&self) -> Result<u64> {
        let retention = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(retention);
        self.db.purge_delivered_outbox_events(cutoff).await
    }

    /// Relay until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Outbox relay started");

        loop {
            match self.relay_pending().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(delivered = n, "Outbox round finished"),
                Err(e) => tracing::warn!(error = %e, "Outbox relay round failed, will retry"),
            }

            match self.purge_delivered().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "Purged delivered outbox events"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge outbox events"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Outbox relay stopped");
    }
}
