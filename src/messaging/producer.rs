//! # Task Producer
//!
//! Publishes tasks into the channel their type routes to.
//!
//! One call makes at most one publish attempt. Failures are logged and
//! reported as `None` by [`TaskProducer::publish`]; callers that need the
//! reason use [`TaskProducer::try_publish`]. A connectivity failure evicts the
//! channel's cached connection so the next publish reconnects.

use tracing::{error, info, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerConnection, PublishProperties};
use super::connection_manager::ConnectionManager;
use super::message::{MessageId, TaskRequest};
use crate::config::LanesConfig;
use crate::error::{LanesError, Result};
use crate::routing::{Channel, ChannelRegistry};

/// Outcome of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub task_id: Uuid,
    pub message_id: MessageId,
    pub channel: Channel,
}

#[derive(Debug)]
pub struct TaskProducer<B: Broker> {
    registry: ChannelRegistry,
    connections: ConnectionManager<B>,
}

impl<B: Broker> TaskProducer<B> {
    pub fn new(registry: ChannelRegistry, connections: ConnectionManager<B>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    pub fn from_config(config: &LanesConfig, broker: B) -> Self {
        Self::new(
            ChannelRegistry::from_config(config),
            ConnectionManager::new(broker)
                .with_queue_verification(config.broker.verify_queue_on_publish),
        )
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager<B> {
        &self.connections
    }

    /// Publish into the channel the task type routes to
    ///
    /// Returns the message id, or `None` if the task was not published.
    pub async fn publish(&self, request: TaskRequest) -> Option<MessageId> {
        self.try_publish(request)
            .await
            .ok()
            .map(|receipt| receipt.message_id)
    }

    /// Publish into an explicitly named channel, bypassing type routing
    pub async fn publish_to(&self, channel_name: &str, request: TaskRequest) -> Option<MessageId> {
        self.try_publish_to(channel_name, request)
            .await
            .ok()
            .map(|receipt| receipt.message_id)
    }

    pub async fn try_publish(&self, request: TaskRequest) -> Result<PublishReceipt> {
        let channel = self.registry.resolve(&request.task_type).map_err(|e| {
            error!(task_type = %request.task_type, error = %e, "Task type has no channel; not published");
            e
        })?;
        self.deliver(channel, request).await
    }

    pub async fn try_publish_to(
        &self,
        channel_name: &str,
        request: TaskRequest,
    ) -> Result<PublishReceipt> {
        let channel = Channel::new(channel_name, self.registry.queue_name());
        self.deliver(channel, request).await
    }

    /// Close every cached connection
    pub async fn shutdown(&self) -> usize {
        self.connections.close_all().await
    }

    async fn deliver(&self, channel: Channel, request: TaskRequest) -> Result<PublishReceipt> {
        // Membership is checked separately from routing so a route pointing
        // at a retired channel is caught here
        if let Err(e) = self.registry.ensure_valid(&channel) {
            error!(
                task_type = %request.task_type,
                channel = %channel.name(),
                error = %e,
                "Channel is not in the configured set; not published"
            );
            return Err(e.into());
        }

        let lease = self.connections.get_connection(&channel).await.map_err(|e| {
            error!(channel = %channel.name(), error = %e, "No broker connection; not published");
            e
        })?;

        let message_id = MessageId::new();
        let task = request.into_task(message_id);

        let body = match task.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(task_id = %task.id, task_type = %task.task_type, error = %e, "Task serialization failed");
                return Err(e.into());
            }
        };

        let published = match lease.connection() {
            Ok(connection) => {
                connection
                    .publish(
                        channel.queue_name(),
                        &body,
                        &PublishProperties::persistent_json(message_id.to_string()),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    message_id = %message_id,
                    task_type = %task.task_type,
                    channel = %channel.name(),
                    "Task published"
                );
                Ok(PublishReceipt {
                    task_id: task.id,
                    message_id,
                    channel,
                })
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    channel = %channel.name(),
                    error = %e,
                    "Publish failed"
                );
                if e.is_connectivity() {
                    lease.evict().await;
                }
                Err(LanesError::from(e))
            }
        }
    }
}
