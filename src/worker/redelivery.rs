//! # Redelivery Policy
//!
//! Decides whether a failed delivery goes back to its queue or is rejected
//! for the broker's dead-letter policy.
//!
//! The delivery count comes from the broker (`x-delivery-count` on quorum
//! queues). Brokers that do not report it fall back to a per-worker counter
//! keyed by the AMQP `message_id`, which only sees deliveries made to this
//! worker process.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::messaging::broker::Delivery;

/// Message ids remembered by the fallback counter
const TRACKED_MESSAGES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryPolicy {
    /// Requeue every failure
    Unbounded,
    /// Reject without requeue once a message has failed this many deliveries
    Bounded { max_deliveries: u32 },
}

impl RedeliveryPolicy {
    /// `0` means unbounded
    pub fn from_max_deliveries(max_deliveries: u32) -> Self {
        if max_deliveries == 0 {
            Self::Unbounded
        } else {
            Self::Bounded { max_deliveries }
        }
    }

    /// Disposition of a failure on the `deliveries`-th delivery (1-based)
    pub fn disposition(&self, deliveries: u32) -> Disposition {
        match self {
            Self::Bounded { max_deliveries } if deliveries >= *max_deliveries => {
                Disposition::DeadLetter
            }
            _ => Disposition::Requeue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue,
    DeadLetter,
}

impl Disposition {
    /// The `requeue` flag for `basic.nack`
    pub fn requeue(&self) -> bool {
        matches!(self, Self::Requeue)
    }
}

#[derive(Debug)]
pub struct RedeliveryTracker {
    policy: RedeliveryPolicy,
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    /// Failures with neither a message id nor a broker count
    uncounted: u64,
}

impl RedeliveryTracker {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            counts: HashMap::new(),
            order: VecDeque::new(),
            uncounted: 0,
        }
    }

    pub fn policy(&self) -> RedeliveryPolicy {
        self.policy
    }

    /// Record a failed delivery and decide what to do with it
    pub fn on_failure(&mut self, delivery: &Delivery) -> Disposition {
        let deliveries = self.record(delivery);
        let disposition = self.policy.disposition(deliveries);
        if disposition == Disposition::DeadLetter {
            if let Some(id) = &delivery.message_id {
                self.counts.remove(id);
            }
        }
        disposition
    }

    /// Forget a message that was acknowledged
    pub fn on_success(&mut self, delivery: &Delivery) {
        if let Some(id) = &delivery.message_id {
            self.counts.remove(id);
        }
    }

    pub fn tracked(&self) -> usize {
        self.counts.len()
    }

    /// Failures the delivery limit could not be applied to
    pub fn uncounted(&self) -> u64 {
        self.uncounted
    }

    fn record(&mut self, delivery: &Delivery) -> u32 {
        let Some(id) = &delivery.message_id else {
            // Nothing to key on; only the broker's count can bound this message
            if let Some(prior) = delivery.prior_deliveries {
                return prior.saturating_add(1);
            }
            self.uncounted = self.uncounted.saturating_add(1);
            // With a limit of one the first failure already dead-letters
            if let RedeliveryPolicy::Bounded { max_deliveries: max_deliveries @ 2.. } = self.policy {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    max_deliveries,
                    uncounted = self.uncounted,
                    "Failed delivery has no message_id and no x-delivery-count; \
                     the delivery limit cannot apply and it will be requeued"
                );
            }
            return 1;
        };

        let counted = self.counts.get(id).copied().unwrap_or(0).saturating_add(1);
        let deliveries = delivery
            .prior_deliveries
            .map_or(counted, |prior| prior.saturating_add(1).max(counted));

        if self.counts.insert(id.clone(), deliveries).is_none() {
            self.order.push_back(id.clone());
            self.evict_oldest();
        }
        debug!(message_id = %id, deliveries, "Recorded failed delivery");
        deliveries
    }

    fn evict_oldest(&mut self) {
        while self.counts.len() > TRACKED_MESSAGES {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        // Ids already removed on success linger in `order` until popped
        if self.order.len() > TRACKED_MESSAGES * 2 {
            let counts = &self.counts;
            self.order.retain(|id| counts.contains_key(id));
        }
    }
}
