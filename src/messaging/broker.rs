//! # Broker Traits
//!
//! Provider-agnostic view of an AMQP-style broker: one connection per virtual
//! host (channel), a passive queue check, persistent publishes, a prefetch
//! ceiling and a pull-style delivery stream settled by delivery tag.
//!
//! Implementations live in [`super::providers`].

use std::time::Duration;

use async_trait::async_trait;

use super::errors::MessagingResult;
use crate::constants::wire;

/// Queue state reported by a passive declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    /// Messages ready for delivery (excludes unacknowledged ones)
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Publish-time message properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub message_id: String,
    pub content_type: &'static str,
    /// Delivery mode 2; the message survives a broker restart
    pub persistent: bool,
}

impl PublishProperties {
    /// Persistent JSON message with the given id
    pub fn persistent_json(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            content_type: wire::CONTENT_TYPE_JSON,
            persistent: true,
        }
    }
}

/// An in-flight message awaiting exactly one ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Prior delivery attempts reported by the broker (`x-delivery-count`)
    pub prior_deliveries: Option<u32>,
}

/// A broker reachable through per-virtual-host connections
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a connection to the given virtual host
    async fn connect(&self, vhost: &str) -> MessagingResult<Self::Connection>;

    /// Get the provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// One open connection bound to a single virtual host
///
/// Errors carry the connection's virtual host as the channel name. Any error
/// classified as connectivity (see
/// [`MessagingError::is_connectivity`](super::MessagingError::is_connectivity))
/// means the connection must be discarded.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Virtual host this connection is bound to
    fn vhost(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Passive queue check; never creates or alters topology
    async fn inspect_queue(&self, queue_name: &str) -> MessagingResult<QueueState>;

    /// Publish on the default exchange with the queue name as routing key
    async fn publish(
        &self,
        queue_name: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()>;

    /// Limit unacknowledged deliveries on this connection
    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()>;

    async fn start_consuming(&mut self, queue_name: &str, consumer_tag: &str)
        -> MessagingResult<()>;

    /// Wait up to `wait` for the next delivery
    ///
    /// `Ok(None)` means the wait elapsed with nothing to deliver.
    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()>;

    /// Close the connection; unacknowledged deliveries return to their queue
    async fn close(self) -> MessagingResult<()>
    where
        Self: Sized;
}
