//! # Broker Providers
//!
//! Enum dispatch over the concrete brokers, so the producer, the consumer
//! loop and the CLI stay non-generic over the configured provider.

mod in_memory;
mod rabbitmq;

use std::time::Duration;

use async_trait::async_trait;

pub use in_memory::{InMemoryBroker, InMemoryConnection};
pub use rabbitmq::{RabbitMqBroker, RabbitMqConnection};

use super::broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueState};
use super::MessagingResult;
use crate::config::{BrokerProviderKind, LanesConfig};

/// Provider enum for zero-cost dispatch
#[derive(Debug, Clone)]
pub enum BrokerProvider {
    /// RabbitMQ via lapin
    RabbitMq(RabbitMqBroker),
    /// In-memory broker for tests and in-process development
    InMemory(InMemoryBroker),
}

impl BrokerProvider {
    /// Build the configured provider
    ///
    /// The in-memory provider starts with the shared queue provisioned in
    /// every configured channel.
    pub fn from_config(config: &LanesConfig) -> Self {
        match config.broker.provider {
            BrokerProviderKind::RabbitMq => Self::RabbitMq(RabbitMqBroker::new(config.broker.clone())),
            BrokerProviderKind::InMemory => {
                Self::InMemory(InMemoryBroker::with_queues(&config.channels, &config.queue_name))
            }
        }
    }
}

#[async_trait]
impl Broker for BrokerProvider {
    type Connection = ProviderConnection;

    async fn connect(&self, vhost: &str) -> MessagingResult<ProviderConnection> {
        match self {
            Self::RabbitMq(b) => b.connect(vhost).await.map(ProviderConnection::RabbitMq),
            Self::InMemory(b) => b.connect(vhost).await.map(ProviderConnection::InMemory),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::RabbitMq(b) => b.provider_name(),
            Self::InMemory(b) => b.provider_name(),
        }
    }
}

#[derive(Debug)]
pub enum ProviderConnection {
    RabbitMq(RabbitMqConnection),
    InMemory(InMemoryConnection),
}

#[async_trait]
impl BrokerConnection for ProviderConnection {
    fn vhost(&self) -> &str {
        match self {
            Self::RabbitMq(c) => c.vhost(),
            Self::InMemory(c) => c.vhost(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            Self::RabbitMq(c) => c.is_open(),
            Self::InMemory(c) => c.is_open(),
        }
    }

    async fn inspect_queue(&self, queue_name: &str) -> MessagingResult<QueueState> {
        match self {
            Self::RabbitMq(c) => c.inspect_queue(queue_name).await,
            Self::InMemory(c) => c.inspect_queue(queue_name).await,
        }
    }

    async fn publish(
        &self,
        queue_name: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.publish(queue_name, body, properties).await,
            Self::InMemory(c) => c.publish(queue_name, body, properties).await,
        }
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.set_prefetch(prefetch_count).await,
            Self::InMemory(c) => c.set_prefetch(prefetch_count).await,
        }
    }

    async fn start_consuming(
        &mut self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.start_consuming(queue_name, consumer_tag).await,
            Self::InMemory(c) => c.start_consuming(queue_name, consumer_tag).await,
        }
    }

    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>> {
        match self {
            Self::RabbitMq(c) => c.next_delivery(wait).await,
            Self::InMemory(c) => c.next_delivery(wait).await,
        }
    }

    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.ack(delivery_tag).await,
            Self::InMemory(c) => c.ack(delivery_tag).await,
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.nack(delivery_tag, requeue).await,
            Self::InMemory(c) => c.nack(delivery_tag, requeue).await,
        }
    }

    async fn close(self) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(c) => c.close().await,
            Self::InMemory(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationMode;

    #[tokio::test]
    async fn test_in_memory_provider_provisions_configured_channels() {
        let mut config = LanesConfig::default();
        config.broker.provider = BrokerProviderKind::InMemory;
        config.supervisor.isolation = IsolationMode::InProcess;

        let provider = BrokerProvider::from_config(&config);
        assert_eq!(provider.provider_name(), "in_memory");

        for channel in &config.channels {
            let connection = provider.connect(channel).await.unwrap();
            assert!(connection.inspect_queue("eventos").await.is_ok());
            assert_eq!(connection.vhost(), channel);
        }
    }

    #[test]
    fn test_rabbitmq_is_default_provider() {
        let provider = BrokerProvider::from_config(&LanesConfig::default());
        assert_eq!(provider.provider_name(), "rabbitmq");
    }
}
