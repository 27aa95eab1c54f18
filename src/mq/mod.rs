//! Message channel
//!
//! A durable, ordered publish/subscribe primitive. The outbox relay appends to a
//! topic;
//! a [`Consumer`] runs one dispatch loop per registered topic and delivers
//! messages to that topic's handler strictly in log order, one at a time.
//!
//! Delivery is at-least-once: the consumer commits a message's offset after its
//! handler returns (successfully or not), so a crash before the commit
//! redelivers it on restart.

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

mod consumer;
mod event;
mod sqlite_broker;

pub use consumer::{Consumer, MessageHandler};
pub use event::{decode_task_created, encode_task_created};
pub use sqlite_broker::SqliteBroker;

/// A message read from the broker log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Position in the log; strictly increasing in publish order
    pub offset: i64,
    /// Topic the message was published to
    pub topic: String,
    /// Opaque message body
    pub payload: Vec<u8>,
    /// Unix timestamp of the publish
    pub published_at: i64,
}

/// Durable, ordered message log with per-group committed offsets
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message to `topic`, returning its offset
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<i64>;

    /// Up to `limit` messages of `topic` with offsets greater than `after`, in order
    async fn fetch(&self, topic: &str, after: i64, limit: usize) -> Result<Vec<Message>>;

    /// Last offset committed by `group` on `topic` (0 when nothing was committed)
    async fn committed_offset(&self, group: &str, topic: &str) -> Result<i64>;

    /// Record that `group` has consumed `topic` up to and including `offset`
    async fn commit_offset(&self, group: &str, topic: &str, offset: i64) -> Result<()>;

    /// Wake-up hint signalled after every publish
    ///
    /// Loops must still poll periodically; the hint only shortens idle waits.
    fn subscribe_notifications(&self) -> Arc<Notify>;
}
