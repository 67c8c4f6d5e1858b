//! # Connection Manager
//!
//! Producer-side cache of one broker connection per channel.
//!
//! Each channel owns a slot guarded by an async mutex. A caller leases the
//! slot for the duration of one publish, so access to a channel's connection
//! is serialized while different channels proceed concurrently. A leased
//! connection that failed is evicted by the caller and the next lease opens a
//! fresh one.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerConnection};
use super::{MessagingError, MessagingResult};
use crate::routing::Channel;

type Slot<C> = Arc<Mutex<Option<C>>>;

pub struct ConnectionManager<B: Broker> {
    broker: B,
    slots: DashMap<String, Slot<B::Connection>>,
    /// Passive queue check whenever a connection is opened
    verify_queue: bool,
}

impl<B: Broker> std::fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider", &self.broker.provider_name())
            .field("channels", &self.slots.len())
            .field("verify_queue", &self.verify_queue)
            .finish()
    }
}

impl<B: Broker> ConnectionManager<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            slots: DashMap::new(),
            verify_queue: true,
        }
    }

    pub fn with_queue_verification(mut self, verify_queue: bool) -> Self {
        self.verify_queue = verify_queue;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Lease the channel's connection, opening one if none is cached or the
    /// cached one is no longer open
    pub async fn get_connection(
        &self,
        channel: &Channel,
    ) -> MessagingResult<LeasedConnection<B::Connection>> {
        let slot = self.slot(channel.name());
        let mut guard = slot.lock_owned().await;

        let reusable = guard.as_ref().is_some_and(|connection| connection.is_open());
        if !reusable {
            if let Some(stale) = guard.take() {
                debug!(channel = %channel.name(), "Discarding closed connection");
                let _ = stale.close().await;
            }

            let connection = self.broker.connect(channel.name()).await?;
            if self.verify_queue {
                if let Err(e) = connection.inspect_queue(channel.queue_name()).await {
                    warn!(
                        channel = %channel.name(),
                        queue = %channel.queue_name(),
                        error = %e,
                        "Queue check failed on new connection"
                    );
                    let _ = connection.close().await;
                    return Err(e);
                }
            }

            info!(
                channel = %channel.name(),
                provider = self.broker.provider_name(),
                "Opened producer connection"
            );
            *guard = Some(connection);
        }

        Ok(LeasedConnection {
            channel: channel.clone(),
            guard,
        })
    }

    /// Close and forget the channel's connection, if any
    pub async fn close(&self, channel_name: &str) -> bool {
        let Some(slot) = self.slots.get(channel_name).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        let connection = slot.lock().await.take();
        match connection {
            Some(connection) => {
                if let Err(e) = connection.close().await {
                    debug!(channel = %channel_name, error = %e, "Error while closing connection");
                }
                true
            }
            None => false,
        }
    }

    /// Close every cached connection; returns how many were closed
    pub async fn close_all(&self) -> usize {
        let names: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for name in names {
            if self.close(&name).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "Closed producer connections");
        }
        closed
    }

    /// Number of channels with a cached, open connection
    pub async fn open_connections(&self) -> usize {
        let slots: Vec<Slot<B::Connection>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut open = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|c| c.is_open()) {
                open += 1;
            }
        }
        open
    }

    fn slot(&self, channel_name: &str) -> Slot<B::Connection> {
        Arc::clone(
            self.slots
                .entry(channel_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }
}

/// Exclusive access to one channel's connection
pub struct LeasedConnection<C: BrokerConnection> {
    channel: Channel,
    guard: OwnedMutexGuard<Option<C>>,
}

impl<C: BrokerConnection> LeasedConnection<C> {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn connection(&self) -> MessagingResult<&C> {
        self.guard.as_ref().ok_or_else(|| {
            MessagingError::connection(self.channel.name(), "leased slot holds no connection")
        })
    }

    /// Close and discard the connection so the next lease reconnects
    pub async fn evict(mut self) {
        if let Some(connection) = self.guard.take() {
            warn!(channel = %self.channel.name(), "Evicting producer connection");
            let _ = connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::providers::InMemoryBroker;

    fn channel(name: &str) -> Channel {
        Channel::new(name, "eventos")
    }

    #[tokio::test]
    async fn test_connection_is_reused_while_open() {
        let broker = InMemoryBroker::with_queues(["fluxo_clinico"], "eventos");
        let manager = ConnectionManager::new(broker.clone());

        drop(manager.get_connection(&channel("fluxo_clinico")).await.unwrap());
        drop(manager.get_connection(&channel("fluxo_clinico")).await.unwrap());

        assert_eq!(broker.total_connects(), 1);
        assert_eq!(manager.open_connections().await, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let broker = InMemoryBroker::with_queues(["fluxo_clinico"], "eventos");
        let manager = ConnectionManager::new(broker.clone());

        drop(manager.get_connection(&channel("fluxo_clinico")).await.unwrap());
        broker.sever_connections("fluxo_clinico");
        let lease = manager.get_connection(&channel("fluxo_clinico")).await.unwrap();

        assert!(lease.connection().unwrap().is_open());
        assert_eq!(broker.total_connects(), 2);
    }

    #[tokio::test]
    async fn test_evict_forces_reconnect() {
        let broker = InMemoryBroker::with_queues(["fluxo_opme"], "eventos");
        let manager = ConnectionManager::new(broker.clone());

        manager
            .get_connection(&channel("fluxo_opme"))
            .await
            .unwrap()
            .evict()
            .await;
        assert_eq!(broker.open_connections("fluxo_opme"), 0);

        drop(manager.get_connection(&channel("fluxo_opme")).await.unwrap());
        assert_eq!(broker.total_connects(), 2);
    }

    #[tokio::test]
    async fn test_missing_queue_fails_verification() {
        let broker = InMemoryBroker::new();
        broker.provision_vhost("fluxo_exames");
        let manager = ConnectionManager::new(broker.clone());

        let err = manager
            .get_connection(&channel("fluxo_exames"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MessagingError::QueueUnavailable { .. }));
        assert_eq!(broker.open_connections("fluxo_exames"), 0);

        let unchecked = ConnectionManager::new(broker).with_queue_verification(false);
        assert!(unchecked.get_connection(&channel("fluxo_exames")).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all_tears_down_every_channel() {
        let broker = InMemoryBroker::with_queues(["fluxo_clinico", "fluxo_exames"], "eventos");
        let manager = ConnectionManager::new(broker.clone());
        drop(manager.get_connection(&channel("fluxo_clinico")).await.unwrap());
        drop(manager.get_connection(&channel("fluxo_exames")).await.unwrap());

        assert_eq!(manager.close_all().await, 2);
        assert_eq!(broker.open_connections("fluxo_clinico"), 0);
        assert_eq!(broker.open_connections("fluxo_exames"), 0);
        assert_eq!(manager.close_all().await, 0);
    }
}
