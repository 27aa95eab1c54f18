//! Dispatch path into the execution engine
//!
//! Everything that wants a task executed goes through a [`Dispatcher`]. The
//! default [`OutboxDispatcher`] records a task-created event in the outbox so the
//! relay publishes it and the consumer picks it up; the execution engine itself
//! also implements the trait for callers that want to run the task in-process.

use crate::db::Database;
use crate::mq::encode_task_created;
use crate::types::{TaskCreatedEvent, TaskId};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

/// Re-enters a task into execution
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Ask for task `task_id` to be executed
    ///
    /// Dispatching is idempotent: dispatching a task that is not Pending is
    /// harmless because execution re-checks the status under the row lock.
    async fn dispatch(&self, task_id: TaskId) -> Result<()>;
}

/// Dispatches by writing a task-created event to the outbox
#[derive(Clone)]
pub struct OutboxDispatcher {
    db: Database,
    topic: String,
    relay_wake: Arc<Notify>,
}

impl OutboxDispatcher {
    /// Create a dispatcher writing events for `topic` and waking the relay on `relay_wake`
    pub fn new(db: Database, topic: impl Into<String>, relay_wake: Arc<Notify>) -> Self {
        Self {
            db,
            topic: topic.into(),
            relay_wake,
        }
    }
}

#[async_trait]
impl Dispatcher for OutboxDispatcher {
    async fn dispatch(&self, task_id: TaskId) -> Result<()> {
        let payload = encode_task_created(&TaskCreatedEvent { id: task_id })?;

        let mut tx = self.db.begin().await?;
        tx.enqueue_outbox_event(&self.topic, &payload).await?;
        tx.commit().await?;

        self.relay_wake.notify_one();
        tracing::debug!(task_id = %task_id, "Task dispatched through outbox");
        Ok(())
    }
}
