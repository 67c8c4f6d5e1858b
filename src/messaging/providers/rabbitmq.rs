//! # RabbitMQ Provider
//!
//! [`Broker`] implementation on AMQP 0.9.1 using the `lapin` crate.
//!
//! ## Features
//!
//! - **One connection per virtual host**: every channel is its own vhost
//! - **Passive queue checks**: topology is provisioned out-of-band and never
//!   declared from here
//! - **Prefetch control**: `basic.qos` bounds unacknowledged deliveries
//! - **Push consumer**: `basic.consume` stream, polled with a timeout so the
//!   caller keeps control between deliveries
//! - **Publisher confirms**: optional, enabled by `broker.publisher_confirms`

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::constants::wire;
use crate::messaging::broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueState};
use crate::messaging::{MessagingError, MessagingResult};

/// RabbitMQ connection factory
#[derive(Debug, Clone)]
pub struct RabbitMqBroker {
    config: BrokerConfig,
}

impl RabbitMqBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Connection URI for a virtual host, built field by field so credentials
    /// and vhost names never need percent-encoding
    fn uri_for(&self, vhost: &str) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                },
                host: self.config.host.clone(),
                port: self.config.port,
            },
            vhost: vhost.to_string(),
            query: AMQPQueryString {
                heartbeat: Some(self.config.heartbeat_seconds),
                connection_timeout: Some(self.config.connection_timeout_seconds * 1000),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    type Connection = RabbitMqConnection;

    async fn connect(&self, vhost: &str) -> MessagingResult<RabbitMqConnection> {
        debug!(
            channel = %vhost,
            endpoint = %self.config.endpoint(),
            "Opening RabbitMQ connection"
        );

        let connection = Connection::connect_uri(
            self.uri_for(vhost),
            ConnectionProperties::default()
                .with_connection_name(format!("tasker-lanes:{vhost}").into()),
        )
        .await
        .map_err(|e| {
            MessagingError::connection(vhost, format!("RabbitMQ connection failed: {e}"))
        })?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(vhost, format!("RabbitMQ channel creation failed: {e}"))
        })?;

        if self.config.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    MessagingError::connection(vhost, format!("Enabling publisher confirms failed: {e}"))
                })?;
        }

        Ok(RabbitMqConnection {
            vhost: vhost.to_string(),
            connection,
            channel,
            consumer: None,
            consuming_queue: None,
        })
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// A RabbitMQ connection with its single AMQP channel
pub struct RabbitMqConnection {
    vhost: String,
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    consuming_queue: Option<String>,
}

impl std::fmt::Debug for RabbitMqConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqConnection")
            .field("vhost", &self.vhost)
            .field("consuming_queue", &self.consuming_queue)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn vhost(&self) -> &str {
        &self.vhost
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn inspect_queue(&self, queue_name: &str) -> MessagingResult<QueueState> {
        // Passive declare: a missing queue closes the AMQP channel with 404
        let queue = self
            .channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::queue_unavailable(&self.vhost, queue_name, e.to_string()))?;

        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(
        &self,
        queue_name: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        let mut amqp_properties = BasicProperties::default()
            .with_content_type(properties.content_type.into())
            .with_message_id(properties.message_id.clone().into());
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(wire::PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",         // Default exchange
                queue_name, // Routing key = queue name
                BasicPublishOptions::default(),
                body,
                amqp_properties,
            )
            .await
            .map_err(|e| {
                MessagingError::publish(&self.vhost, queue_name, format!("Publish failed: {e}"))
            })?;

        // Resolves immediately unless confirm mode is on
        let confirmation = confirm.await.map_err(|e| {
            MessagingError::publish(
                &self.vhost,
                queue_name,
                format!("Publish confirmation failed: {e}"),
            )
        })?;
        if confirmation.is_nack() {
            return Err(MessagingError::publish(
                &self.vhost,
                queue_name,
                "broker rejected the message",
            ));
        }

        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::connection(&self.vhost, format!("Failed to set QoS: {e}")))
    }

    async fn start_consuming(
        &mut self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> MessagingResult<()> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::consume(&self.vhost, queue_name, format!("basic.consume failed: {e}"))
            })?;

        self.consumer = Some(consumer);
        self.consuming_queue = Some(queue_name.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>> {
        let queue_name = self.consuming_queue.clone().unwrap_or_default();
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(MessagingError::consume(
                &self.vhost,
                queue_name,
                "not consuming; call start_consuming first",
            ));
        };

        match tokio::time::timeout(wait, consumer.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(MessagingError::consume(
                &self.vhost,
                queue_name,
                "consumer stream ended (connection or channel closed)",
            )),
            Ok(Some(Err(e))) => Err(MessagingError::consume(&self.vhost, queue_name, e.to_string())),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                message_id: delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                prior_deliveries: delivery
                    .properties
                    .headers()
                    .as_ref()
                    .and_then(delivery_count),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::ack(&self.vhost, delivery_tag, format!("ack failed: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                MessagingError::nack(&self.vhost, delivery_tag, format!("nack failed: {e}"))
            })
    }

    async fn close(self) -> MessagingResult<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "OK").await {
                debug!(channel = %self.vhost, error = %e, "Channel close failed");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await.map_err(|e| {
                warn!(channel = %self.vhost, error = %e, "Connection close failed");
                MessagingError::connection(&self.vhost, format!("close failed: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Read the quorum-queue delivery counter from message headers
fn delivery_count(headers: &FieldTable) -> Option<u32> {
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == wire::DELIVERY_COUNT_HEADER)
        .and_then(|(_, value)| amqp_to_u32(value))
}

fn amqp_to_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}
