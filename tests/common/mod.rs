#![allow(dead_code)]

pub mod handlers;
pub mod strategies;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use tasker_lanes::config::{BrokerProviderKind, IsolationMode, LanesConfig};
use tasker_lanes::messaging::{ConnectionManager, InMemoryBroker, TaskProducer};
use tasker_lanes::routing::{Channel, ChannelRegistry};
use tasker_lanes::worker::{
    ConsumerLoop, ConsumerSettings, ConsumerStats, ConsumerSummary, RedeliveryPolicy,
    ShutdownSignal, TaskHandler,
};

pub use handlers::ScriptedHandler;

pub const QUEUE: &str = "eventos";
pub const DEAD_LETTER_QUEUE: &str = "eventos.dlq";

/// In-memory, in-process configuration with test-speed timings
pub fn lane_config() -> LanesConfig {
    let mut config = LanesConfig::default();
    config.broker.provider = BrokerProviderKind::InMemory;
    config.supervisor.isolation = IsolationMode::InProcess;
    config.supervisor.monitor_interval_seconds = 1;
    config.supervisor.shutdown_grace_seconds = 2;
    config.worker.reconnect_delay_ms = 20;
    config.worker.poll_interval_ms = 10;
    config
}

/// Broker with the shared queue provisioned on every reference channel
pub fn reference_broker() -> InMemoryBroker {
    InMemoryBroker::with_queues(tasker_lanes::constants::channels::ALL, QUEUE)
}

pub fn producer(broker: &InMemoryBroker) -> TaskProducer<InMemoryBroker> {
    TaskProducer::new(
        ChannelRegistry::reference(),
        ConnectionManager::new(broker.clone()),
    )
}

pub fn settings(max_deliveries: u32) -> ConsumerSettings {
    ConsumerSettings {
        queue_name: QUEUE.to_string(),
        prefetch_count: 1,
        reconnect_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        policy: RedeliveryPolicy::from_max_deliveries(max_deliveries),
        consumer_tag: "tasker-lanes-test".to_string(),
    }
}

/// A consumer loop running on a background task
pub struct RunningConsumer {
    pub shutdown: ShutdownSignal,
    pub stats: Arc<ConsumerStats>,
    join: JoinHandle<ConsumerSummary>,
}

impl RunningConsumer {
    pub fn spawn(
        channel: &str,
        broker: &InMemoryBroker,
        handler: Arc<dyn TaskHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let consumer = ConsumerLoop::new(
            Channel::new(channel, QUEUE),
            broker.clone(),
            handler,
            settings,
            shutdown.clone(),
        );
        let stats = consumer.stats();
        Self {
            shutdown,
            stats,
            join: tokio::spawn(consumer.run()),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub async fn stop(self) -> ConsumerSummary {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.join)
            .await
            .expect("consumer loop did not stop")
            .expect("consumer loop panicked")
    }
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for checks that need to await
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
