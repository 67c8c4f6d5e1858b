//! # Messaging Module
//!
//! Broker plumbing for the lanes: the task wire format, the provider-agnostic
//! broker traits and their RabbitMQ/in-memory implementations, the
//! producer-side connection cache and the producer itself.

pub mod broker;
pub mod connection_manager;
pub mod errors;
pub mod message;
pub mod producer;
pub mod providers;

pub use broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueState};
pub use connection_manager::{ConnectionManager, LeasedConnection};
pub use errors::{MessagingError, MessagingResult};
pub use message::{MessageId, Task, TaskRequest};
pub use producer::{PublishReceipt, TaskProducer};
pub use providers::{BrokerProvider, InMemoryBroker, ProviderConnection, RabbitMqBroker};
