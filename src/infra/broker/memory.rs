//! In-memory pull broker for development/testing.
//!
//! Behaves like a single durable pull consumer: messages wait in a ready
//! queue, a fetch hands them out as deliveries, and each delivery stays
//! outstanding until it is acked, nacked or its ack-wait runs out. Nacked and
//! expired messages go back to the ready queue for redelivery. Every
//! disposition is recorded per message so tests can check them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{
    AckHandle, BrokerError, ConsumerOptions, Delivery, InboundMessage, MessageSource, Publisher,
};

/// How often a waiting fetch re-checks for expired deliveries.
const RECHECK: Duration = Duration::from_millis(10);

/// Everything that happened to one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRecord {
    /// Times the message was handed out.
    pub deliveries: u32,
    /// Acks received, across all deliveries.
    pub acks: u32,
    /// Naks received, across all deliveries.
    pub naks: u32,
    /// Progress signals received.
    pub in_progress: u32,
    /// Deliveries that ran past ack-wait and were redelivered.
    pub expirations: u32,
    /// Acks or naks that arrived after their delivery had expired.
    pub late_dispositions: u32,
}

impl MessageRecord {
    /// Acks plus naks.
    #[must_use]
    pub const fn terminal_dispositions(&self) -> u32 {
        self.acks + self.naks
    }
}

struct Ready {
    message_id: u64,
    payload: Vec<u8>,
}

struct Outstanding {
    message_id: u64,
    payload: Vec<u8>,
    last_activity: Instant,
}

#[derive(Default)]
struct BrokerInner {
    ready: VecDeque<Ready>,
    outstanding: HashMap<String, Outstanding>,
    expired: HashSet<String>,
    records: HashMap<u64, MessageRecord>,
    next_message_id: u64,
    options: Option<ConsumerOptions>,
    published: Vec<(String, Vec<u8>)>,
    failing_fetches: u32,
}

impl BrokerInner {
    fn ack_wait(&self) -> Duration {
        self.options
            .as_ref()
            .map_or_else(|| ConsumerOptions::default().ack_wait, |o| o.ack_wait)
    }

    fn expire_overdue(&mut self, now: Instant) {
        let ack_wait = self.ack_wait();
        let overdue: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, o)| now.duration_since(o.last_activity) >= ack_wait)
            .map(|(id, _)| id.clone())
            .collect();
        for delivery_id in overdue {
            if let Some(o) = self.outstanding.remove(&delivery_id) {
                self.records.entry(o.message_id).or_default().expirations += 1;
                self.ready.push_back(Ready {
                    message_id: o.message_id,
                    payload: o.payload,
                });
                self.expired.insert(delivery_id);
            }
        }
    }

    fn room(&self) -> usize {
        self.options.as_ref().map_or(usize::MAX, |o| {
            (o.max_ack_pending as usize).saturating_sub(self.outstanding.len())
        })
    }
}

struct BrokerState {
    inner: Mutex<BrokerInner>,
    notify: Notify,
}

/// In-memory broker implementing [`MessageSource`] and [`Publisher`].
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(BrokerInner::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Make a message available for fetching; returns its id.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let message_id = {
            let mut inner = self.state.inner.lock();
            inner.next_message_id += 1;
            let message_id = inner.next_message_id;
            inner.records.insert(message_id, MessageRecord::default());
            inner.ready.push_back(Ready {
                message_id,
                payload: payload.into(),
            });
            message_id
        };
        self.state.notify.notify_one();
        message_id
    }

    /// Push a JSON document.
    pub fn push_json(&self, value: &serde_json::Value) -> u64 {
        self.push(value.to_string())
    }

    /// Record of one message.
    #[must_use]
    pub fn record(&self, message_id: u64) -> Option<MessageRecord> {
        self.state.inner.lock().records.get(&message_id).cloned()
    }

    /// Messages waiting to be fetched.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.state.inner.lock().ready.len()
    }

    /// Deliveries handed out and not yet disposed or expired.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.state.inner.lock().outstanding.len()
    }

    /// Consumer options from the last `configure_consumer` call.
    #[must_use]
    pub fn consumer_options(&self) -> Option<ConsumerOptions> {
        self.state.inner.lock().options.clone()
    }

    /// Payloads published on `subject`, oldest first.
    #[must_use]
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.state
            .inner
            .lock()
            .published
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Make the next `count` fetches fail as if the broker were unreachable.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.inner.lock().failing_fetches = count;
    }

    fn take_batch(&self, batch: usize) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut inner = self.state.inner.lock();
        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(BrokerError::Unavailable("simulated outage".into()));
        }
        inner.expire_overdue(Instant::now());

        let count = batch.min(inner.room()).min(inner.ready.len());
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(ready) = inner.ready.pop_front() else {
                break;
            };
            let record = inner.records.entry(ready.message_id).or_default();
            record.deliveries += 1;
            let delivery_id = format!("{}.{}", ready.message_id, record.deliveries);
            inner.outstanding.insert(
                delivery_id.clone(),
                Outstanding {
                    message_id: ready.message_id,
                    payload: ready.payload.clone(),
                    last_activity: Instant::now(),
                },
            );
            let handle = MemoryAckHandle {
                state: Arc::clone(&self.state),
                delivery_id,
                message_id: ready.message_id,
            };
            messages.push(InboundMessage {
                payload: ready.payload,
                delivery: Delivery::new(Arc::new(handle)),
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn configure_consumer(&self, options: &ConsumerOptions) -> Result<(), BrokerError> {
        self.state.inner.lock().options = Some(options.clone());
        Ok(())
    }

    async fn fetch(
        &self,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.take_batch(batch)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(messages);
            }
            let wait = (deadline - now).min(RECHECK);
            let _ = tokio::time::timeout(wait, self.state.notify.notified()).await;
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.state
            .inner
            .lock()
            .published
            .push((subject.to_owned(), payload));
        Ok(())
    }
}

struct MemoryAckHandle {
    state: Arc<BrokerState>,
    delivery_id: String,
    message_id: u64,
}

impl MemoryAckHandle {
    fn settle(&self, redeliver: bool) -> Result<(), BrokerError> {
        let mut inner = self.state.inner.lock();
        let Some(outstanding) = inner.outstanding.remove(&self.delivery_id) else {
            // A late disposition of an expired delivery is accepted and ignored.
            if inner.expired.remove(&self.delivery_id) {
                inner.records.entry(self.message_id).or_default().late_dispositions += 1;
                return Ok(());
            }
            return Err(BrokerError::AlreadyDisposed(self.delivery_id.clone()));
        };
        let record = inner.records.entry(self.message_id).or_default();
        if redeliver {
            record.naks += 1;
        } else {
            record.acks += 1;
        }
        if redeliver {
            inner.ready.push_back(Ready {
                message_id: outstanding.message_id,
                payload: outstanding.payload,
            });
            drop(inner);
            self.state.notify.notify_one();
        }
        Ok(())
    }
}

impl Drop for MemoryAckHandle {
    fn drop(&mut self) {
        self.state.inner.lock().expired.remove(&self.delivery_id);
    }
}

#[async_trait]
impl AckHandle for MemoryAckHandle {
    fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.settle(true)
    }

    async fn in_progress(&self) -> Result<(), BrokerError> {
        let mut inner = self.state.inner.lock();
        inner.records.entry(self.message_id).or_default().in_progress += 1;
        match inner.outstanding.get_mut(&self.delivery_id) {
            Some(outstanding) => {
                outstanding.last_activity = Instant::now();
                Ok(())
            }
            None => Err(BrokerError::AlreadyDisposed(self.delivery_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nak_redelivers_and_ack_settles() {
        let broker = InMemoryBroker::new();
        let id = broker.push("hello");

        let mut first = broker.fetch(5, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        first.remove(0).delivery.nak().await.unwrap();

        let mut second = broker.fetch(5, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.len(), 1);
        second.remove(0).delivery.ack().await.unwrap();

        let record = broker.record(id).unwrap();
        assert_eq!(record.deliveries, 2);
        assert_eq!((record.acks, record.naks), (1, 1));
        assert_eq!(broker.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn max_ack_pending_limits_outstanding() {
        let broker = InMemoryBroker::new();
        broker
            .configure_consumer(&ConsumerOptions {
                max_ack_pending: 2,
                ..ConsumerOptions::default()
            })
            .await
            .unwrap();
        for i in 0..4 {
            broker.push(format!("m{i}"));
        }
        let batch = broker.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(broker.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());
        for message in batch {
            message.delivery.ack().await.unwrap();
        }
        assert_eq!(broker.fetch(10, Duration::from_millis(10)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expired_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        broker
            .configure_consumer(&ConsumerOptions {
                ack_wait: Duration::from_millis(30),
                max_ack_pending: 10,
                ..ConsumerOptions::default()
            })
            .await
            .unwrap();
        let id = broker.push("slow");
        let first = broker.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        let again = broker.fetch(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(broker.record(id).unwrap().expirations, 1);
        assert_eq!(broker.state.inner.lock().expired.len(), 1);
        drop(first);
        assert!(broker.state.inner.lock().expired.is_empty());
        drop(again);
    }

    #[tokio::test]
    async fn only_accepted_dispositions_are_counted() {
        let broker = InMemoryBroker::new();
        let id = broker.push("once");
        let mut batch = broker.fetch(1, Duration::from_millis(10)).await.unwrap();
        let handle = MemoryAckHandle {
            state: Arc::clone(&broker.state),
            delivery_id: batch[0].delivery.id().to_owned(),
            message_id: id,
        };

        batch.remove(0).delivery.ack().await.unwrap();
        assert!(matches!(
            handle.ack().await,
            Err(BrokerError::AlreadyDisposed(_))
        ));
        assert!(handle.nak().await.is_err());

        let record = broker.record(id).unwrap();
        assert_eq!((record.acks, record.naks), (1, 0));
        assert_eq!(record.late_dispositions, 0);
        assert_eq!(broker.ready_count(), 0);
    }

    #[tokio::test]
    async fn simulated_outage_fails_fetch() {
        let broker = InMemoryBroker::new();
        broker.fail_next_fetches(1);
        assert!(broker.fetch(1, Duration::from_millis(5)).await.is_err());
        assert!(broker.fetch(1, Duration::from_millis(5)).await.unwrap().is_empty());
    }
}
