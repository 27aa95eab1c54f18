//! Topic consumer with an owned dispatch table.

use crate::error::BrokerError;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Message, MessageBroker};
use crate::config::MqConfig;

/// Boxed async handler invoked once per delivered message
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Consumer that delivers each topic's messages to one registered handler
///
/// Handlers are registered before [`start`](Consumer::start); starting consumes
/// the consumer so the dispatch table cannot change while loops are running.
pub struct Consumer {
    broker: Arc<dyn MessageBroker>,
    group: String,
    poll_interval: Duration,
    batch_size: usize,
    handlers: HashMap<String, MessageHandler>,
}

impl Consumer {
    /// Create a consumer in the group named by `config.client_id`
    pub fn new(broker: Arc<dyn MessageBroker>, config: &MqConfig) -> Self {
        Self {
            broker,
            group: config.client_id.clone(),
            poll_interval: config.poll_interval,
            batch_size: config.fetch_batch_size.max(1),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `topic`
    ///
    /// Fails with [`BrokerError::DuplicateHandler`] if the topic already has one.
    pub fn register_handler<F, Fut>(&mut self, topic: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(Error::Broker(BrokerError::DuplicateHandler(topic)));
        }

        let handler: MessageHandler =
            Arc::new(move |message| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(message))
            });
        self.handlers.insert(topic, handler);
        Ok(())
    }

    /// Topics with a registered handler
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run one dispatch loop per topic until `shutdown` is cancelled
    ///
    /// A message being handled when shutdown arrives is finished and committed
    /// before its loop exits.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(Error::Broker(BrokerError::NoHandlers));
        }

        let loops: Vec<_> = self
            .handlers
            .into_iter()
            .map(|(topic, handler)| {
                let dispatch = DispatchLoop {
                    broker: self.broker.clone(),
                    group: self.group.clone(),
                    topic,
                    handler,
                    poll_interval: self.poll_interval,
                    batch_size: self.batch_size,
                };
                tokio::spawn(dispatch.run(shutdown.clone()))
            })
            .collect();

        for result in futures::future::join_all(loops).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consumer dispatch loop panicked");
            }
        }

        tracing::info!(group = %self.group, "Consumer stopped");
        Ok(())
    }
}

struct DispatchLoop {
    broker: Arc<dyn MessageBroker>,
    group: String,
    topic: String,
    handler: MessageHandler,
    poll_interval: Duration,
    batch_size: usize,
}

impl DispatchLoop {
    async fn run(self, shutdown: CancellationToken) {
        let notify = self.broker.subscribe_notifications();

        let mut position = loop {
            match self.broker.committed_offset(&self.group, &self.topic).await {
                Ok(offset) => break offset,
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "Failed to read committed offset");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        };

        tracing::info!(topic = %self.topic, group = %self.group, position, "Dispatch loop started");

        'poll: loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Registered before the fetch so a publish racing it still wakes us
            let notified = notify.notified();

            let batch = match self
                .broker
                .fetch(&self.topic, position, self.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "Fetch failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = notified => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            for message in batch {
                if shutdown.is_cancelled() {
                    break 'poll;
                }

                let offset = message.offset;
                if let Err(e) = (self.handler)(message).await {
                    tracing::error!(
                        topic = %self.topic,
                        offset,
                        error = %e,
                        "Message handler failed"
                    );
                }

                if let Err(e) = self
                    .broker
                    .commit_offset(&self.group, &self.topic, offset)
                    .await
                {
                    tracing::warn!(topic = %self.topic, offset, error = %e, "Offset commit failed");
                }
                position = offset;
            }
        }

        tracing::info!(topic = %self.topic, "Dispatch loop stopped");
    }
}
