//! Message broker boundary: pull consumer, per-message dispositions and the
//! publisher used for status events.
//!
//! A [`Delivery`] is the only way the pipeline touches a message's
//! disposition. It is not `Clone`, and [`Delivery::ack`] / [`Delivery::nak`]
//! consume it, so a message can be terminally disposed at most once. The
//! heartbeat ticker only ever receives a [`ProgressSignal`], which can extend
//! the ack-wait window but cannot dispose the message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::BrokerError;

/// Broker-side capability attached to a single delivered message.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Stable identifier of this delivery (stream sequence, delivery tag, ...).
    fn delivery_id(&self) -> &str;
    /// Acknowledge: the message is done and must not be redelivered.
    async fn ack(&self) -> Result<(), BrokerError>;
    /// Negative-acknowledge: ask the broker to redeliver.
    async fn nak(&self) -> Result<(), BrokerError>;
    /// Reset the broker's ack-wait timer for this delivery.
    async fn in_progress(&self) -> Result<(), BrokerError>;
}

/// Owned handle on a delivered message.
pub struct Delivery {
    handle: Arc<dyn AckHandle>,
    disposed: bool,
}

impl Delivery {
    /// Wrap a broker handle.
    #[must_use]
    pub fn new(handle: Arc<dyn AckHandle>) -> Self {
        Self {
            handle,
            disposed: false,
        }
    }

    /// Delivery identifier for logs.
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.delivery_id()
    }

    /// Terminal success disposition.
    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.disposed = true;
        self.handle.ack().await
    }

    /// Terminal failure disposition; the broker will redeliver.
    pub async fn nak(mut self) -> Result<(), BrokerError> {
        self.disposed = true;
        self.handle.nak().await
    }

    /// Extend the ack-wait window without disposing the message.
    pub async fn in_progress(&self) -> Result<(), BrokerError> {
        self.handle.in_progress().await
    }

    /// Progress-only view of this delivery for background keep-alives.
    #[must_use]
    pub fn progress_signal(&self) -> ProgressSignal {
        ProgressSignal {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.disposed {
            debug!(
                delivery_id = self.handle.delivery_id(),
                "delivery dropped without disposition; broker will redeliver after ack-wait"
            );
        }
    }
}

/// Keep-alive capability split off a [`Delivery`]. Cannot ack or nak.
#[derive(Clone)]
pub struct ProgressSignal {
    handle: Arc<dyn AckHandle>,
}

impl ProgressSignal {
    /// Reset the broker's ack-wait timer.
    pub async fn in_progress(&self) -> Result<(), BrokerError> {
        self.handle.in_progress().await
    }

    /// Delivery identifier for logs.
    #[must_use]
    pub fn delivery_id(&self) -> &str {
        self.handle.delivery_id()
    }
}

/// Durable pull-consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Stream holding object-store notifications.
    pub stream: String,
    /// Subject the consumer filters on.
    pub subject: String,
    /// Durable consumer name, shared by all worker replicas.
    pub durable: String,
    /// Broker-side redelivery timeout for an un-acked message.
    pub ack_wait: Duration,
    /// Ceiling on un-acked messages handed to this consumer.
    pub max_ack_pending: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            stream: "BBMOVIE".into(),
            subject: "minio.events".into(),
            durable: "transcode-worker".into(),
            ack_wait: Duration::from_secs(300),
            max_ack_pending: 1,
        }
    }
}

/// A raw message pulled from the broker.
#[derive(Debug)]
pub struct InboundMessage {
    /// Message body.
    pub payload: Vec<u8>,
    /// Disposition handle.
    pub delivery: Delivery,
}

/// Pull-based, at-least-once message source.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Create or update the durable consumer before fetching.
    async fn configure_consumer(&self, options: &ConsumerOptions) -> Result<(), BrokerError>;
    /// Pull up to `batch` messages, waiting at most `timeout`. An empty vec
    /// means nothing arrived in time.
    async fn fetch(
        &self,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, BrokerError>;
}

/// Fire-and-forget subject publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}
