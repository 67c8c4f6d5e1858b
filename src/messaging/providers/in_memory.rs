//! # In-Memory Provider
//!
//! Thread-safe in-memory broker for testing and single-process development.
//!
//! ## Features
//!
//! - **Virtual hosts and queues**: provisioned up front, like a real broker;
//!   connecting to an unknown vhost or checking an unknown queue fails
//! - **AMQP settlement semantics**: delivery tags, prefetch enforcement,
//!   requeue to the head of the queue with the redelivered flag set,
//!   dead-letter targets for rejected messages
//! - **Delivery counting**: reports prior deliveries the way quorum queues do
//! - **Fault injection**: refuse connections, fail the next N connects, sever
//!   every open connection on a vhost

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::messaging::broker::{Broker, BrokerConnection, Delivery, PublishProperties, QueueState};
use crate::messaging::{MessagingError, MessagingResult};

type QueueKey = (String, String);

/// A stored message with its delivery history
#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
    /// Times this message has been handed to a consumer
    deliveries: u32,
}

#[derive(Debug)]
struct Unacked {
    message: StoredMessage,
    connection_id: u64,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    dead_letter: Option<QueueKey>,
    consumers: usize,
}

#[derive(Debug)]
struct ConnectionRecord {
    vhost: String,
    severed: bool,
}

#[derive(Debug)]
struct BrokerState {
    vhosts: Vec<String>,
    queues: HashMap<QueueKey, InMemoryQueue>,
    connections: HashMap<u64, ConnectionRecord>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    unreachable: bool,
    pending_connect_failures: u32,
    report_delivery_count: bool,
    total_connects: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            vhosts: Vec::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
            next_delivery_tag: 1,
            unreachable: false,
            pending_connect_failures: 0,
            report_delivery_count: true,
            total_connects: 0,
        }
    }
}

impl BrokerState {
    fn ensure_open(&self, connection_id: u64, vhost: &str) -> MessagingResult<()> {
        match self.connections.get(&connection_id) {
            Some(record) if !record.severed => Ok(()),
            _ => Err(MessagingError::connection(vhost, "connection closed by broker")),
        }
    }

    /// Return every unacked message held by a connection to the head of its queue
    fn requeue_unacked(&mut self, connection_id: u64) -> usize {
        let mut returned = 0;
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, entry)| entry.connection_id == connection_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so the oldest delivery ends up at the head
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(entry) = queue.unacked.remove(&tag) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    returned += 1;
                }
            }
        }
        returned
    }

    fn release_connection(&mut self, connection_id: u64, consuming: Option<&QueueKey>) -> usize {
        let returned = self.requeue_unacked(connection_id);
        if let Some(key) = consuming {
            if let Some(queue) = self.queues.get_mut(key) {
                queue.consumers = queue.consumers.saturating_sub(1);
            }
        }
        self.connections.remove(&connection_id);
        returned
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker with `queue_name` provisioned in each of the given vhosts
    pub fn with_queues<I, S>(vhosts: I, queue_name: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let broker = Self::new();
        for vhost in vhosts {
            broker.provision_queue(vhost.as_ref(), queue_name);
        }
        broker
    }

    /// Stop reporting prior deliveries, as a classic (non-quorum) queue would
    pub fn without_delivery_count(self) -> Self {
        self.shared.state.lock().report_delivery_count = false;
        self
    }

    pub fn provision_vhost(&self, vhost: &str) {
        let mut state = self.shared.state.lock();
        if !state.vhosts.iter().any(|v| v == vhost) {
            state.vhosts.push(vhost.to_string());
        }
    }

    /// Create a queue (and its vhost) if missing
    pub fn provision_queue(&self, vhost: &str, queue_name: &str) {
        self.provision_vhost(vhost);
        self.shared
            .state
            .lock()
            .queues
            .entry((vhost.to_string(), queue_name.to_string()))
            .or_default();
    }

    /// Create a queue whose rejected messages move to `dead_letter_queue`
    pub fn provision_queue_with_dead_letter(
        &self,
        vhost: &str,
        queue_name: &str,
        dead_letter_queue: &str,
    ) {
        self.provision_queue(vhost, dead_letter_queue);
        self.provision_queue(vhost, queue_name);
        let mut state = self.shared.state.lock();
        if let Some(queue) = state
            .queues
            .get_mut(&(vhost.to_string(), queue_name.to_string()))
        {
            queue.dead_letter = Some((vhost.to_string(), dead_letter_queue.to_string()));
        }
    }

    pub fn delete_queue(&self, vhost: &str, queue_name: &str) {
        self.shared
            .state
            .lock()
            .queues
            .remove(&(vhost.to_string(), queue_name.to_string()));
    }

    /// Ready (not yet delivered) messages in a queue
    pub fn queue_depth(&self, vhost: &str, queue_name: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(&(vhost.to_string(), queue_name.to_string()))
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, vhost: &str, queue_name: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(&(vhost.to_string(), queue_name.to_string()))
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Bodies of the ready messages, head first
    pub fn peek_bodies(&self, vhost: &str, queue_name: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .queues
            .get(&(vhost.to_string(), queue_name.to_string()))
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Enqueue a raw body directly, bypassing any connection
    pub fn inject(&self, vhost: &str, queue_name: &str, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.shared.state.lock();
            let queue = state
                .queues
                .entry((vhost.to_string(), queue_name.to_string()))
                .or_default();
            queue.ready.push_back(StoredMessage {
                body: body.into(),
                message_id: None,
                redelivered: false,
                deliveries: 0,
            });
        }
        self.shared.notify.notify_waiters();
    }

    /// Refuse every new connection while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.state.lock().unreachable = unreachable;
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connections(&self, count: u32) {
        self.shared.state.lock().pending_connect_failures = count;
    }

    /// Drop every open connection on a vhost, as a broker restart would
    ///
    /// Unacknowledged messages go back to their queues. Returns the number of
    /// connections severed.
    pub fn sever_connections(&self, vhost: &str) -> usize {
        let severed = {
            let mut state = self.shared.state.lock();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, record)| record.vhost == vhost && !record.severed)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                state.requeue_unacked(*id);
                if let Some(record) = state.connections.get_mut(id) {
                    record.severed = true;
                }
            }
            ids.len()
        };
        self.shared.notify.notify_waiters();
        severed
    }

    /// Connections currently open (not severed) on a vhost
    pub fn open_connections(&self, vhost: &str) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .values()
            .filter(|record| record.vhost == vhost && !record.severed)
            .count()
    }

    /// Successful connects since creation
    pub fn total_connects(&self) -> u64 {
        self.shared.state.lock().total_connects
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self, vhost: &str) -> MessagingResult<InMemoryConnection> {
        let mut state = self.shared.state.lock();
        if state.unreachable {
            return Err(MessagingError::connection(vhost, "connection refused"));
        }
        if state.pending_connect_failures > 0 {
            state.pending_connect_failures -= 1;
            return Err(MessagingError::connection(vhost, "connection refused (injected)"));
        }
        if !state.vhosts.iter().any(|v| v == vhost) {
            return Err(MessagingError::connection(
                vhost,
                format!("access to vhost '{vhost}' refused: vhost not found"),
            ));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.total_connects += 1;
        state.connections.insert(
            id,
            ConnectionRecord {
                vhost: vhost.to_string(),
                severed: false,
            },
        );

        Ok(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            vhost: vhost.to_string(),
            prefetch: Mutex::new(0),
            consuming: None,
        })
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

/// Connection to one vhost of an [`InMemoryBroker`]
///
/// Dropping the connection releases it like a closed socket: unacknowledged
/// deliveries return to the head of their queue.
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    vhost: String,
    /// 0 = unlimited
    prefetch: Mutex<u16>,
    consuming: Option<QueueKey>,
}

impl InMemoryConnection {
    fn key(&self, queue_name: &str) -> QueueKey {
        (self.vhost.clone(), queue_name.to_string())
    }

    /// Hand out the head of the consumed queue if prefetch allows
    fn try_take(&self, state: &mut BrokerState, key: &QueueKey) -> MessagingResult<Option<Delivery>> {
        state.ensure_open(self.id, &self.vhost)?;

        let prefetch = *self.prefetch.lock();
        let next_tag = state.next_delivery_tag;
        let report_count = state.report_delivery_count;
        let queue = state
            .queues
            .get_mut(key)
            .ok_or_else(|| MessagingError::consume(&self.vhost, &key.1, "queue deleted"))?;

        let in_flight = queue
            .unacked
            .values()
            .filter(|entry| entry.connection_id == self.id)
            .count();
        if prefetch > 0 && in_flight >= usize::from(prefetch) {
            return Ok(None);
        }

        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        message.deliveries += 1;

        let delivery = Delivery {
            delivery_tag: next_tag,
            body: message.body.clone(),
            message_id: message.message_id.clone(),
            redelivered: message.redelivered,
            prior_deliveries: (report_count && message.deliveries > 1)
                .then(|| message.deliveries - 1),
        };
        queue.unacked.insert(
            next_tag,
            Unacked {
                message,
                connection_id: self.id,
            },
        );
        state.next_delivery_tag += 1;

        Ok(Some(delivery))
    }

    fn settle(&self, delivery_tag: u64) -> MessagingResult<Option<(QueueKey, Unacked, Option<QueueKey>)>> {
        let mut state = self.shared.state.lock();
        state.ensure_open(self.id, &self.vhost)?;
        for (key, queue) in state.queues.iter_mut() {
            let owned = queue
                .unacked
                .get(&delivery_tag)
                .is_some_and(|entry| entry.connection_id == self.id);
            if owned {
                let dead_letter = queue.dead_letter.clone();
                let entry = queue.unacked.remove(&delivery_tag);
                return Ok(entry.map(|entry| (key.clone(), entry, dead_letter)));
            }
        }
        Ok(None)
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        let returned = self
            .shared
            .state
            .lock()
            .release_connection(self.id, self.consuming.as_ref());
        if returned > 0 {
            self.shared.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn vhost(&self) -> &str {
        &self.vhost
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().ensure_open(self.id, &self.vhost).is_ok()
    }

    async fn inspect_queue(&self, queue_name: &str) -> MessagingResult<QueueState> {
        let state = self.shared.state.lock();
        state.ensure_open(self.id, &self.vhost)?;
        state
            .queues
            .get(&self.key(queue_name))
            .map(|queue| QueueState {
                message_count: queue.ready.len() as u32,
                consumer_count: queue.consumers as u32,
            })
            .ok_or_else(|| {
                MessagingError::queue_unavailable(
                    &self.vhost,
                    queue_name,
                    format!("NOT_FOUND - no queue '{queue_name}' in vhost '{}'", self.vhost),
                )
            })
    }

    async fn publish(
        &self,
        queue_name: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        {
            let mut state = self.shared.state.lock();
            state
                .ensure_open(self.id, &self.vhost)
                .map_err(|e| MessagingError::publish(&self.vhost, queue_name, e.to_string()))?;
            // Unroutable messages are dropped, as on the default exchange
            if let Some(queue) = state.queues.get_mut(&self.key(queue_name)) {
                queue.ready.push_back(StoredMessage {
                    body: body.to_vec(),
                    message_id: Some(properties.message_id.clone()),
                    redelivered: false,
                    deliveries: 0,
                });
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.shared.state.lock().ensure_open(self.id, &self.vhost)?;
        *self.prefetch.lock() = prefetch_count;
        Ok(())
    }

    async fn start_consuming(
        &mut self,
        queue_name: &str,
        _consumer_tag: &str,
    ) -> MessagingResult<()> {
        let key = self.key(queue_name);
        {
            let mut state = self.shared.state.lock();
            state
                .ensure_open(self.id, &self.vhost)
                .map_err(|e| MessagingError::consume(&self.vhost, queue_name, e.to_string()))?;
            let queue = state.queues.get_mut(&key).ok_or_else(|| {
                MessagingError::consume(&self.vhost, queue_name, "NOT_FOUND - no such queue")
            })?;
            queue.consumers += 1;
        }
        self.consuming = Some(key);
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>> {
        let Some(key) = self.consuming.clone() else {
            return Err(MessagingError::consume(
                &self.vhost,
                "",
                "not consuming; call start_consuming first",
            ));
        };
        let deadline = Instant::now() + wait;
        // A network broker always suspends between deliveries; without this a
        // consumer requeueing to the head never yields
        tokio::task::yield_now().await;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(delivery) = self
                    .try_take(&mut state, &key)
                    .map_err(|e| MessagingError::consume(&self.vhost, &key.1, e.to_string()))?
                {
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        match self.settle(delivery_tag) {
            Ok(Some(_)) => {
                // A freed prefetch slot may unblock this connection's next poll
                self.shared.notify.notify_waiters();
                Ok(())
            }
            Ok(None) => Err(MessagingError::ack(
                &self.vhost,
                delivery_tag,
                "PRECONDITION_FAILED - unknown delivery tag",
            )),
            Err(e) => Err(MessagingError::ack(&self.vhost, delivery_tag, e.to_string())),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        let (key, entry, dead_letter) = match self.settle(delivery_tag) {
            Ok(Some(settled)) => settled,
            Ok(None) => {
                return Err(MessagingError::nack(
                    &self.vhost,
                    delivery_tag,
                    "PRECONDITION_FAILED - unknown delivery tag",
                ))
            }
            Err(e) => return Err(MessagingError::nack(&self.vhost, delivery_tag, e.to_string())),
        };

        {
            let mut state = self.shared.state.lock();
            let mut message = entry.message;
            let target = if requeue { Some(key) } else { dead_letter };
            if let Some(target) = target {
                if let Some(queue) = state.queues.get_mut(&target) {
                    if requeue {
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    } else {
                        message.redelivered = false;
                        queue.ready.push_back(message);
                    }
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(self) -> MessagingResult<()> {
        // Drop releases the connection
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VHOST: &str = "fluxo_exames";
    const QUEUE: &str = "eventos";

    fn props(id: &str) -> PublishProperties {
        PublishProperties::persistent_json(id)
    }

    async fn consuming_connection(broker: &InMemoryBroker, prefetch: u16) -> InMemoryConnection {
        let mut connection = broker.connect(VHOST).await.unwrap();
        connection.set_prefetch(prefetch).await.unwrap();
        connection.start_consuming(QUEUE, "test").await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_unknown_vhost_is_refused() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        let err = broker.connect("fluxo_inexistente").await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_passive_check_reports_missing_queue() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        let connection = broker.connect(VHOST).await.unwrap();
        assert!(connection.inspect_queue(QUEUE).await.is_ok());
        assert!(matches!(
            connection.inspect_queue("outra").await,
            Err(MessagingError::QueueUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight_deliveries() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        broker.inject(VHOST, QUEUE, b"1".to_vec());
        broker.inject(VHOST, QUEUE, b"2".to_vec());

        let mut connection = consuming_connection(&broker, 1).await;
        let first = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        connection.ack(first.delivery_tag).await.unwrap();
        let second = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head_with_redelivered_flag() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        broker.inject(VHOST, QUEUE, b"first".to_vec());
        broker.inject(VHOST, QUEUE, b"second".to_vec());

        let mut connection = consuming_connection(&broker, 1).await;
        let delivery = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(delivery.prior_deliveries, None);
        connection.nack(delivery.delivery_tag, true).await.unwrap();

        let again = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.body, b"first");
        assert!(again.redelivered);
        assert_eq!(again.prior_deliveries, Some(1));
        assert_ne!(again.delivery_tag, delivery.delivery_tag);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.provision_queue_with_dead_letter(VHOST, QUEUE, "eventos_dlq");
        broker.inject(VHOST, QUEUE, b"poison".to_vec());

        let mut connection = consuming_connection(&broker, 1).await;
        let delivery = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        connection.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth(VHOST, QUEUE), 0);
        assert_eq!(broker.peek_bodies(VHOST, "eventos_dlq"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_sever_returns_unacked_and_fails_operations() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        broker.inject(VHOST, QUEUE, b"x".to_vec());

        let mut connection = consuming_connection(&broker, 1).await;
        let delivery = connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.sever_connections(VHOST), 1);
        assert!(!connection.is_open());
        assert_eq!(broker.queue_depth(VHOST, QUEUE), 1);
        assert!(connection.ack(delivery.delivery_tag).await.unwrap_err().is_connectivity());
        assert!(connection
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap_err()
            .is_connectivity());
    }

    #[tokio::test]
    async fn test_dropping_connection_requeues_unacked() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        broker.inject(VHOST, QUEUE, b"x".to_vec());
        {
            let mut connection = consuming_connection(&broker, 1).await;
            connection
                .next_delivery(Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(broker.unacked_count(VHOST, QUEUE), 1);
        }
        assert_eq!(broker.unacked_count(VHOST, QUEUE), 0);
        assert_eq!(broker.queue_depth(VHOST, QUEUE), 1);
        assert_eq!(broker.open_connections(VHOST), 0);
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        let mut consumer = consuming_connection(&broker, 1).await;
        let publisher = broker.connect(VHOST).await.unwrap();

        let waiter =
            tokio::spawn(async move { consumer.next_delivery(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(QUEUE, b"late", &props("m-1")).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
        assert_eq!(delivery.message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let broker = InMemoryBroker::with_queues([VHOST], QUEUE);
        broker.fail_next_connections(2);
        assert!(broker.connect(VHOST).await.is_err());
        assert!(broker.connect(VHOST).await.is_err());
        assert!(broker.connect(VHOST).await.is_ok());
        assert_eq!(broker.total_connects(), 1);
    }
}
