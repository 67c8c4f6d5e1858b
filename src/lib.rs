#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Lanes
//!
//! Channel-isolated task dispatch over RabbitMQ.
//!
//! Every task type routes to exactly one channel (a RabbitMQ virtual host with
//! a single `eventos` queue). A supervisor keeps one worker per channel alive;
//! each worker runs a consumer loop that survives broker restarts, acks
//! successful tasks and requeues failed ones up to a redelivery limit.
//!
//! ## Module Organization
//!
//! - [`routing`] - task type to channel resolution and the closed set of task kinds
//! - [`messaging`] - wire format, broker providers, connection cache and producer
//! - [`worker`] - consumer loop, handlers, redelivery policy, shutdown signal
//! - [`supervisor`] - one worker per channel, respawned when it dies
//! - [`config`] - layered configuration
//! - [`logging`] - tracing subscriber setup
//! - [`error`] - crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_lanes::config::ConfigLoader;
//! use tasker_lanes::messaging::{BrokerProvider, TaskProducer, TaskRequest};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! let producer = TaskProducer::from_config(&config, BrokerProvider::from_config(&config));
//!
//! let request = TaskRequest::new("hemograma").with_data(json!({"paciente": {"id": 1}}));
//! if let Some(message_id) = producer.publish(request).await {
//!     println!("published {message_id}");
//! }
//! producer.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod routing;
pub mod supervisor;
pub mod worker;

pub use config::{ConfigLoader, LanesConfig};
pub use error::{LanesError, Result};
pub use messaging::{BrokerProvider, MessageId, Task, TaskProducer, TaskRequest};
pub use routing::{Channel, ChannelRegistry, TaskKind};
pub use supervisor::WorkerSupervisor;
pub use worker::{ConsumerLoop, ShutdownSignal};
