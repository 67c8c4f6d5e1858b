//! # System Constants
//!
//! Channel names, the shared queue name and the operational defaults that
//! define the boundaries of the lane dispatch system.

use std::time::Duration;

/// Channel (virtual host) names of the reference deployment
pub mod channels {
    pub const FLUXO_CLINICO: &str = "fluxo_clinico";
    pub const FLUXO_EXAMES: &str = "fluxo_exames";
    pub const FLUXO_OPME: &str = "fluxo_opme";
    pub const INGESTAO_DADOS: &str = "ingestao_dados";

    /// Every channel a default deployment provisions, in supervisor start order
    pub const ALL: [&str; 4] = [FLUXO_CLINICO, FLUXO_EXAMES, FLUXO_OPME, INGESTAO_DADOS];
}

/// Wire-level constants shared by producer and consumer
pub mod wire {
    /// Queue that holds every task inside a channel's virtual host
    pub const DEFAULT_QUEUE_NAME: &str = "eventos";

    pub const CONTENT_TYPE_JSON: &str = "application/json";

    /// AMQP delivery mode for messages that survive a broker restart
    pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

    /// Header set by quorum queues with the number of prior delivery attempts
    pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
}

/// Defaults for every externally supplied setting
pub mod defaults {
    use super::Duration;

    pub const BROKER_HOST: &str = "localhost";
    pub const BROKER_PORT: u16 = 5672;
    pub const BROKER_USERNAME: &str = "guest";
    pub const BROKER_PASSWORD: &str = "guest";
    pub const HEARTBEAT_SECONDS: u16 = 60;
    pub const CONNECTION_TIMEOUT_SECONDS: u64 = 30;

    pub const PREFETCH_COUNT: u16 = 1;
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_DELIVERIES: u32 = 10;

    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
}

/// Environment variables understood outside the `TASKER_LANES_` namespace
pub mod env {
    pub const CONFIG_PATH: &str = "TASKER_LANES_CONFIG";
    pub const ENVIRONMENT: &str = "TASKER_LANES_ENV";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";

    pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
    pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
    pub const RABBITMQ_USER: &str = "RABBITMQ_USER";
    pub const RABBITMQ_PASS: &str = "RABBITMQ_PASS";
    pub const WORKER_PREFETCH_COUNT: &str = "WORKER_PREFETCH_COUNT";
    pub const WORKER_RECONNECT_DELAY: &str = "WORKER_RECONNECT_DELAY";
}
