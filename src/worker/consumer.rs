//! # Consumer Loop
//!
//! One channel's worker loop:
//!
//! ```text
//! Disconnected -> Connecting -> QueueCheck -> Consuming -> (error) -> Disconnected
//!                                                 \-> Stopped (shutdown)
//! ```
//!
//! Every delivery is settled exactly once: ack after a successful handler
//! outcome, nack according to the [`RedeliveryPolicy`] otherwise. Broker
//! faults never end the loop; the connection is discarded and re-established
//! after a fixed backoff. Only the shutdown signal stops it, and it is checked
//! between bounded polls so an in-flight delivery is always settled first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::handler::TaskHandler;
use super::redelivery::{Disposition, RedeliveryPolicy, RedeliveryTracker};
use super::shutdown::ShutdownSignal;
use crate::config::LanesConfig;
use crate::messaging::broker::{Broker, BrokerConnection, Delivery, QueueState};
use crate::messaging::message::Task;
use crate::messaging::{MessagingError, MessagingResult};
use crate::routing::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    QueueCheck,
    Consuming,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub prefetch_count: u16,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    pub policy: RedeliveryPolicy,
    pub consumer_tag: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &LanesConfig, channel: &Channel) -> Self {
        Self {
            queue_name: channel.queue_name().to_string(),
            prefetch_count: config.worker.prefetch_count,
            reconnect_delay: config.worker.reconnect_delay(),
            poll_interval: config.worker.poll_interval(),
            policy: RedeliveryPolicy::from_max_deliveries(config.worker.max_deliveries),
            consumer_tag: format!("tasker-lanes-{}-{}", channel.name(), std::process::id()),
        }
    }
}

/// Runtime counters for one consumer loop
#[derive(Debug)]
pub struct ConsumerStats {
    pub deliveries: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub decode_failures: AtomicU64,
    pub handler_failures: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub connect_failures: AtomicU64,
    pub queue_unavailable: AtomicU64,
    pub connection_losses: AtomicU64,
    state: Mutex<ConsumerState>,
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self {
            deliveries: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            queue_unavailable: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            state: Mutex::new(ConsumerState::Disconnected),
        }
    }
}

impl ConsumerStats {
    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    pub fn snapshot(&self) -> ConsumerSummary {
        ConsumerSummary {
            state: self.state(),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            queue_unavailable: self.queue_unavailable.load(Ordering::Relaxed),
            connection_losses: self.connection_losses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub state: ConsumerState,
    pub deliveries: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub queue_unavailable: u64,
    pub connection_losses: u64,
}

pub struct ConsumerLoop<B: Broker> {
    channel: Channel,
    broker: B,
    handler: Arc<dyn TaskHandler>,
    settings: ConsumerSettings,
    shutdown: ShutdownSignal,
    stats: Arc<ConsumerStats>,
}

impl<B: Broker> std::fmt::Debug for ConsumerLoop<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("channel", &self.channel)
            .field("provider", &self.broker.provider_name())
            .field("settings", &self.settings)
            .field("state", &self.stats.state())
            .finish()
    }
}

impl<B: Broker> ConsumerLoop<B> {
    pub fn new(
        channel: Channel,
        broker: B,
        handler: Arc<dyn TaskHandler>,
        settings: ConsumerSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            channel,
            broker,
            handler,
            settings,
            shutdown,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Shared counters; stay readable after [`Self::run`] consumes the loop
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown is requested
    pub async fn run(self) -> ConsumerSummary {
        info!(
            channel = %self.channel.name(),
            queue = %self.settings.queue_name,
            provider = self.broker.provider_name(),
            prefetch_count = self.settings.prefetch_count,
            policy = ?self.settings.policy,
            "Consumer loop starting"
        );

        let mut connection: Option<B::Connection> = None;
        let mut tracker = RedeliveryTracker::new(self.settings.policy);

        while !self.shutdown.is_requested() {
            if connection.is_none() {
                match self.establish().await {
                    Ok(conn) => connection = Some(conn),
                    Err(_) => self.backoff().await,
                }
                continue;
            }
            let Some(conn) = connection.as_mut() else {
                continue;
            };

            let lost = match conn.next_delivery(self.settings.poll_interval).await {
                Ok(None) => None,
                Ok(Some(delivery)) => self.process(&*conn, delivery, &mut tracker).await.err(),
                Err(e) => Some(e),
            };

            if let Some(e) = lost {
                warn!(channel = %self.channel.name(), error = %e, "Lost broker connection");
                self.stats.connection_losses.fetch_add(1, Ordering::Relaxed);
                if let Some(stale) = connection.take() {
                    let _ = stale.close().await;
                }
                self.backoff().await;
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close().await {
                debug!(channel = %self.channel.name(), error = %e, "Error closing connection on shutdown");
            }
        }
        self.stats.set_state(ConsumerState::Stopped);

        let summary = self.stats.snapshot();
        info!(
            channel = %self.channel.name(),
            deliveries = summary.deliveries,
            acked = summary.acked,
            requeued = summary.requeued,
            dead_lettered = summary.dead_lettered,
            "Consumer loop stopped"
        );
        summary
    }

    /// Connect, check the queue and start consuming
    async fn establish(&self) -> MessagingResult<B::Connection> {
        self.stats.set_state(ConsumerState::Connecting);
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let mut conn = match self.broker.connect(self.channel.name()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %self.channel.name(),
                    error = %e,
                    retry_in_ms = self.settings.reconnect_delay.as_millis() as u64,
                    "Broker connection failed"
                );
                return Err(e);
            }
        };

        self.stats.set_state(ConsumerState::QueueCheck);
        match self.prepare(&mut conn).await {
            Ok(queue) => {
                self.stats.set_state(ConsumerState::Consuming);
                info!(
                    channel = %self.channel.name(),
                    queue = %self.settings.queue_name,
                    ready = queue.message_count,
                    consumers = queue.consumer_count,
                    "Consuming"
                );
                Ok(conn)
            }
            Err(e) => {
                if matches!(e, MessagingError::QueueUnavailable { .. }) {
                    self.stats.queue_unavailable.fetch_add(1, Ordering::Relaxed);
                    error!(
                        channel = %self.channel.name(),
                        queue = %self.settings.queue_name,
                        error = %e,
                        "Queue unavailable; it must be provisioned on the broker"
                    );
                } else {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %self.channel.name(), error = %e, "Consumer setup failed");
                }
                let _ = conn.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, conn: &mut B::Connection) -> MessagingResult<QueueState> {
        let queue = conn.inspect_queue(&self.settings.queue_name).await?;
        conn.set_prefetch(self.settings.prefetch_count).await?;
        conn.start_consuming(&self.settings.queue_name, &self.settings.consumer_tag)
            .await?;
        Ok(queue)
    }

    async fn backoff(&self) {
        self.stats.set_state(ConsumerState::Disconnected);
        self.shutdown.sleep(self.settings.reconnect_delay).await;
    }

    /// Handle one delivery and settle it
    ///
    /// Errors are settlement failures, which mean the connection is gone.
    async fn process(
        &self,
        conn: &B::Connection,
        delivery: Delivery,
        tracker: &mut RedeliveryTracker,
    ) -> MessagingResult<()> {
        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        let tag = delivery.delivery_tag;

        let task = match Task::decode(&delivery.body, delivery.message_id.as_deref()) {
            Ok(task) => task,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    channel = %self.channel.name(),
                    delivery_tag = tag,
                    message_id = ?delivery.message_id,
                    error = %e,
                    "Undecodable delivery"
                );
                return self.reject(conn, &delivery, tracker).await;
            }
        };

        debug!(
            channel = %self.channel.name(),
            delivery_tag = tag,
            task_id = %task.id,
            task_type = %task.task_type,
            redelivered = delivery.redelivered,
            "Received task"
        );

        let succeeded = match self.handler.handle(&task).await {
            Ok(outcome) if outcome.is_success() => true,
            Ok(outcome) => {
                warn!(
                    channel = %self.channel.name(),
                    task_id = %task.id,
                    error = outcome.error.as_deref().unwrap_or("unspecified"),
                    "Handler reported an error status"
                );
                false
            }
            Err(e) => {
                warn!(channel = %self.channel.name(), task_id = %task.id, error = %e, "Handler failed");
                false
            }
        };

        if !succeeded {
            self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            return self.reject(conn, &delivery, tracker).await;
        }

        conn.ack(tag).await?;
        tracker.on_success(&delivery);
        self.stats.acked.fetch_add(1, Ordering::Relaxed);
        info!(
            channel = %self.channel.name(),
            delivery_tag = tag,
            task_id = %task.id,
            message_id = ?delivery.message_id,
            "Task completed"
        );
        Ok(())
    }

    async fn reject(
        &self,
        conn: &B::Connection,
        delivery: &Delivery,
        tracker: &mut RedeliveryTracker,
    ) -> MessagingResult<()> {
        let disposition = tracker.on_failure(delivery);
        conn.nack(delivery.delivery_tag, disposition.requeue()).await?;

        match disposition {
            Disposition::Requeue => {
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %self.channel.name(), delivery_tag = delivery.delivery_tag, "Delivery requeued");
            }
            Disposition::DeadLetter => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %self.channel.name(),
                    delivery_tag = delivery.delivery_tag,
                    message_id = ?delivery.message_id,
                    "Redelivery limit reached; rejected without requeue"
                );
            }
        }
        Ok(())
    }
}
