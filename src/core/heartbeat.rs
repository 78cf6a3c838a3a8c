//! Keep-alive signals for messages under long-running work.
//!
//! While a task is being probed or processed, a ticker periodically calls
//! `in_progress` on its delivery so the broker does not redeliver it when the
//! ack-wait window runs out. The [`HeartbeatHandle`] owns the [`Delivery`]
//! while the ticker runs; stopping the heartbeat either hands the delivery
//! back untouched or disposes it, and a terminal disposition is only issued
//! after the ticker has exited.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{BrokerError, Delivery, ProgressSignal};

/// How long a stop waits for an in-flight tick before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Registry key: task id plus a per-start nonce, so the same task can hold
/// several heartbeats over its life without collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeartbeatId {
    task_id: String,
    nonce: Uuid,
}

impl HeartbeatId {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            nonce: Uuid::new_v4(),
        }
    }

    /// Task this heartbeat belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl fmt::Display for HeartbeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task_id, self.nonce.simple())
    }
}

struct HeartbeatState {
    interval: Duration,
    root: CancellationToken,
    active: Mutex<HashMap<HeartbeatId, CancellationToken>>,
    ticks: AtomicU64,
    tick_failures: AtomicU64,
}

/// Starts and stops per-message heartbeats. Cheap to clone.
#[derive(Clone)]
pub struct HeartbeatManager {
    state: Arc<HeartbeatState>,
}

impl fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("interval", &self.state.interval)
            .field("active", &self.active_heartbeat_count())
            .finish()
    }
}

impl HeartbeatManager {
    /// Manager ticking every `interval` (at least 1 ms).
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "heartbeat manager initialized");
        Self {
            state: Arc::new(HeartbeatState {
                interval,
                root: CancellationToken::new(),
                active: Mutex::new(HashMap::new()),
                ticks: AtomicU64::new(0),
                tick_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Start signalling progress for `delivery`. The first tick fires one
    /// interval after the start. Must be called inside a tokio runtime.
    pub fn start_heartbeat(&self, task_id: &str, delivery: Delivery) -> HeartbeatHandle {
        let id = HeartbeatId::new(task_id);
        let token = self.state.root.child_token();
        self.state.active.lock().insert(id.clone(), token.clone());

        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&self.state),
            id.clone(),
            token.clone(),
            delivery.progress_signal(),
        ));
        debug!(heartbeat_id = %id, "heartbeat started");

        HeartbeatHandle {
            id,
            delivery: Some(delivery),
            token,
            ticker: Some(ticker),
            state: Arc::clone(&self.state),
        }
    }

    /// Stop the heartbeat and hand the delivery back undisposed.
    pub async fn stop_heartbeat(&self, mut handle: HeartbeatHandle) -> Delivery {
        handle.halt().await;
        handle.take_delivery()
    }

    /// Stop the heartbeat, then acknowledge.
    ///
    /// # Errors
    /// Propagates the broker's ack failure.
    pub async fn stop_and_ack(&self, handle: HeartbeatHandle) -> Result<(), BrokerError> {
        let id = handle.id.clone();
        let delivery = self.stop_heartbeat(handle).await;
        let result = delivery.ack().await;
        debug!(heartbeat_id = %id, ok = result.is_ok(), "heartbeat stopped and message acked");
        result
    }

    /// Stop the heartbeat, then negatively acknowledge.
    ///
    /// # Errors
    /// Propagates the broker's nak failure.
    pub async fn stop_and_nak(&self, handle: HeartbeatHandle) -> Result<(), BrokerError> {
        let id = handle.id.clone();
        let delivery = self.stop_heartbeat(handle).await;
        let result = delivery.nak().await;
        debug!(heartbeat_id = %id, ok = result.is_ok(), "heartbeat stopped and message nacked");
        result
    }

    /// Heartbeats currently running.
    #[must_use]
    pub fn active_heartbeat_count(&self) -> usize {
        self.state.active.lock().len()
    }

    /// Successful ticks since creation.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// Failed ticks since creation.
    #[must_use]
    pub fn failed_ticks(&self) -> u64 {
        self.state.tick_failures.load(Ordering::Relaxed)
    }

    /// Cancel every heartbeat. Heartbeats started afterwards never tick.
    /// Deliveries stay with their handles.
    pub fn shutdown(&self) {
        let active = self.active_heartbeat_count();
        self.state.root.cancel();
        info!(active, "heartbeat manager shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.root.is_cancelled()
    }
}

async fn run_ticker(
    state: Arc<HeartbeatState>,
    id: HeartbeatId,
    token: CancellationToken,
    progress: ProgressSignal,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + state.interval, state.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                match progress.in_progress().await {
                    Ok(()) => {
                        state.ticks.fetch_add(1, Ordering::Relaxed);
                        debug!(heartbeat_id = %id, delivery_id = progress.delivery_id(), "heartbeat sent");
                    }
                    Err(e) => {
                        state.tick_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(heartbeat_id = %id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
    state.active.lock().remove(&id);
}

/// A running heartbeat. Owns the delivery until stopped.
///
/// Dropping the handle cancels the ticker and drops the delivery undisposed.
pub struct HeartbeatHandle {
    id: HeartbeatId,
    delivery: Option<Delivery>,
    token: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    state: Arc<HeartbeatState>,
}

impl HeartbeatHandle {
    /// Registry key of this heartbeat.
    #[must_use]
    pub const fn id(&self) -> &HeartbeatId {
        &self.id
    }

    /// Delivery identifier, for logs.
    #[must_use]
    pub fn delivery_id(&self) -> Option<&str> {
        self.delivery.as_ref().map(Delivery::id)
    }

    async fn halt(&mut self) {
        self.token.cancel();
        if let Some(mut ticker) = self.ticker.take() {
            if tokio::time::timeout(STOP_GRACE, &mut ticker).await.is_err() {
                warn!(heartbeat_id = %self.id, "heartbeat tick still in flight after grace; aborting");
                ticker.abort();
            }
        }
        self.state.active.lock().remove(&self.id);
    }

    fn take_delivery(&mut self) -> Delivery {
        match self.delivery.take() {
            Some(delivery) => delivery,
            None => unreachable!("heartbeat handle always owns its delivery until stopped"),
        }
    }
}

impl fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("id", &self.id.to_string())
            .field("running", &self.ticker.is_some())
            .finish()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if self.ticker.is_some() {
            self.state.active.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AckHandle;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Recorder {
        acks: AtomicU32,
        naks: AtomicU32,
        progress: AtomicU32,
    }

    #[async_trait]
    impl AckHandle for Recorder {
        fn delivery_id(&self) -> &str {
            "d-1"
        }
        async fn ack(&self) -> Result<(), BrokerError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn nak(&self) -> Result<(), BrokerError> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn in_progress(&self) -> Result<(), BrokerError> {
            self.progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn ticks_until_stopped_then_acks_once() {
        let recorder = Arc::new(Recorder::default());
        let manager = HeartbeatManager::new(Duration::from_millis(20));
        let handle = manager.start_heartbeat("t-1", Delivery::new(recorder.clone()));
        assert_eq!(manager.active_heartbeat_count(), 1);

        tokio::time::sleep(Duration::from_millis(110)).await;
        manager.stop_and_ack(handle).await.unwrap();
        let ticks = recorder.progress.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
        assert_eq!(manager.active_heartbeat_count(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.progress.load(Ordering::SeqCst), ticks);
        assert_eq!(recorder.acks.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_without_disposition_returns_delivery() {
        let recorder = Arc::new(Recorder::default());
        let manager = HeartbeatManager::new(Duration::from_secs(30));
        let handle = manager.start_heartbeat("t-2", Delivery::new(recorder.clone()));
        let delivery = manager.stop_heartbeat(handle).await;
        assert_eq!(recorder.acks.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.naks.load(Ordering::SeqCst), 0);
        delivery.nak().await.unwrap();
        assert_eq!(recorder.naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_ticker() {
        let recorder = Arc::new(Recorder::default());
        let manager = HeartbeatManager::new(Duration::from_millis(10));
        let handles: Vec<_> = (0..3)
            .map(|i| manager.start_heartbeat(&format!("t-{i}"), Delivery::new(recorder.clone())))
            .collect();
        manager.shutdown();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.active_heartbeat_count(), 0);
        let frozen = recorder.progress.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(recorder.progress.load(Ordering::SeqCst), frozen);
        drop(handles);
    }

    #[tokio::test]
    async fn dropped_handle_leaves_registry() {
        let recorder = Arc::new(Recorder::default());
        let manager = HeartbeatManager::new(Duration::from_secs(30));
        let handle = manager.start_heartbeat("t-3", Delivery::new(recorder));
        drop(handle);
        assert_eq!(manager.active_heartbeat_count(), 0);
    }
}
