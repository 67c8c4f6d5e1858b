//! # Lane Configuration
//!
//! Everything a deployment can tune: broker connection, the channel set and
//! its routing table, consumer loop timings, supervision and the external
//! orchestrator command. Every field has a compiled default, so an empty
//! configuration is a working single-host deployment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_lanes::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! println!("prefetch: {}", config.worker.prefetch_count);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{channels, defaults, wire};
use crate::routing::TaskKind;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    pub broker: BrokerConfig,
    /// Queue name shared by every channel's virtual host
    pub queue_name: String,
    /// Valid channels; one worker is supervised per entry
    pub channels: Vec<String>,
    /// Task type to channel routing table
    pub routing: BTreeMap<String, String>,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queue_name: wire::DEFAULT_QUEUE_NAME.to_string(),
            channels: channels::ALL.iter().map(|c| c.to_string()).collect(),
            routing: TaskKind::ALL
                .iter()
                .map(|kind| (kind.as_str().to_string(), kind.default_channel().to_string()))
                .collect(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl LanesConfig {
    /// Check every hard constraint, collecting all violations
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.queue_name.trim().is_empty() {
            errors.push("queue_name must not be empty".to_string());
        }

        if self.channels.is_empty() {
            errors.push("channels must list at least one channel".to_string());
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.trim().is_empty() {
                errors.push("channel names must not be empty".to_string());
            } else if !seen.insert(channel.as_str()) {
                errors.push(format!("channel '{channel}' is listed more than once"));
            }
        }

        if self.broker.host.trim().is_empty() {
            errors.push("broker.host must not be empty".to_string());
        }
        if self.worker.prefetch_count == 0 {
            errors.push("worker.prefetch_count must be greater than zero".to_string());
        }
        if self.worker.reconnect_delay_ms == 0 {
            errors.push("worker.reconnect_delay_ms must be greater than zero".to_string());
        }
        if self.worker.poll_interval_ms == 0 {
            errors.push("worker.poll_interval_ms must be greater than zero".to_string());
        }
        if self.supervisor.monitor_interval_seconds == 0 {
            errors.push("supervisor.monitor_interval_seconds must be greater than zero".to_string());
        }
        if self.supervisor.isolation == IsolationMode::Process
            && self.broker.provider == BrokerProviderKind::InMemory
        {
            errors.push(
                "supervisor.isolation = \"process\" cannot be combined with the in_memory broker; \
                 worker processes would not share its queues"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::validation(errors))
        }
    }

    /// Non-fatal findings worth logging at startup
    pub fn warnings(&self) -> Vec<String> {
        self.routing
            .iter()
            .filter(|(_, channel)| !self.channels.contains(channel))
            .map(|(task_type, channel)| {
                format!(
                    "task type '{task_type}' is routed to '{channel}', which is not a configured channel; \
                     publishes of this type will be rejected"
                )
            })
            .collect()
    }
}

/// Which broker implementation backs the channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BrokerProviderKind {
    #[default]
    #[serde(rename = "rabbitmq")]
    RabbitMq,
    #[serde(rename = "in_memory")]
    InMemory,
}

impl fmt::Display for BrokerProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RabbitMq => f.write_str("rabbitmq"),
            Self::InMemory => f.write_str("in_memory"),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub provider: BrokerProviderKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub heartbeat_seconds: u16,
    pub connection_timeout_seconds: u64,
    /// Wait for broker confirmation of every publish
    pub publisher_confirms: bool,
    /// Passive queue check when the producer opens a connection
    pub verify_queue_on_publish: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: BrokerProviderKind::default(),
            host: defaults::BROKER_HOST.to_string(),
            port: defaults::BROKER_PORT,
            username: defaults::BROKER_USERNAME.to_string(),
            password: defaults::BROKER_PASSWORD.to_string(),
            heartbeat_seconds: defaults::HEARTBEAT_SECONDS,
            connection_timeout_seconds: defaults::CONNECTION_TIMEOUT_SECONDS,
            publisher_confirms: false,
            verify_queue_on_publish: true,
        }
    }
}

impl BrokerConfig {
    /// `host:port` for log lines
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("provider", &self.provider)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .field("connection_timeout_seconds", &self.connection_timeout_seconds)
            .field("publisher_confirms", &self.publisher_confirms)
            .field("verify_queue_on_publish", &self.verify_queue_on_publish)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum unacknowledged deliveries per worker
    pub prefetch_count: u16,
    pub reconnect_delay_ms: u64,
    /// Upper bound on one wait for a delivery; shutdown is noticed between waits
    pub poll_interval_ms: u64,
    /// Failed deliveries before a message is dead-lettered; 0 requeues forever
    pub max_deliveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: defaults::PREFETCH_COUNT,
            reconnect_delay_ms: defaults::RECONNECT_DELAY.as_millis() as u64,
            poll_interval_ms: defaults::POLL_INTERVAL.as_millis() as u64,
            max_deliveries: defaults::MAX_DELIVERIES,
        }
    }
}

impl WorkerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How supervised workers are isolated from each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// One child OS process per channel
    #[default]
    Process,
    /// One tokio task per channel inside the supervisor process
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub monitor_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub isolation: IsolationMode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: defaults::MONITOR_INTERVAL.as_secs(),
            shutdown_grace_seconds: defaults::SHUTDOWN_GRACE.as_secs(),
            isolation: IsolationMode::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// External agent orchestrator invoked by the lane handlers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Program and arguments; empty means tasks are acknowledged without an agent run
    pub command: Vec<String>,
    /// Per-task limit; 0 disables the limit
    pub timeout_seconds: u64,
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}
