//! Bounded hand-off queues between the pipeline stages.
//!
//! Each queue is a `flume` channel gated by a slot semaphore. A producer
//! takes a slot before sending and the slot travels with the item as a
//! [`Leased`] value; the slot goes back when the consumer calls
//! [`Leased::into_inner`] (or drops the item). A consumer that wants to put
//! an item back, like a prober requeueing a task it could not admit, hands
//! the lease to [`BoundedQueue::requeue`], which reuses the slot and so can
//! never block on a full queue.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::core::{ExecuteTask, PipelineError, ProbeTask};

/// A queue slot detached from its item. Dropping it frees the slot.
#[derive(Debug)]
pub struct QueueSlot {
    _permit: OwnedSemaphorePermit,
}

/// An item together with the queue slot it occupies.
pub struct Leased<T> {
    item: T,
    slot: QueueSlot,
}

impl<T> Leased<T> {
    /// Release the slot and keep the item.
    pub fn into_inner(self) -> T {
        self.item
    }

    /// Separate the item from its slot, e.g. to rebuild the item before a
    /// requeue.
    pub fn into_parts(self) -> (T, QueueSlot) {
        (self.item, self.slot)
    }

    /// Rejoin an item with a slot taken from the same queue.
    pub const fn from_parts(item: T, slot: QueueSlot) -> Self {
        Self { item, slot }
    }
}

impl<T> Deref for Leased<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for Leased<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: fmt::Debug> fmt::Debug for Leased<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Leased").field(&self.item).finish()
    }
}

/// FIFO queue holding at most `capacity` items, counting leased items that
/// a consumer is still working on.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    slots: Arc<Semaphore>,
    tx: flume::Sender<Leased<T>>,
    rx: flume::Receiver<Leased<T>>,
}

impl<T> BoundedQueue<T> {
    /// Queue named `name` for logs. A zero capacity is raised to 1.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::unbounded();
        Self {
            name,
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            tx,
            rx,
        }
    }

    /// Enqueue, waiting for a free slot. This is the backpressure point.
    ///
    /// # Errors
    /// [`PipelineError::QueueClosed`] if the queue was closed.
    pub async fn put(&self, item: T) -> Result<(), PipelineError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::QueueClosed(self.name))?;
        self.send(Leased { item, slot: QueueSlot { _permit: slot } })
            .map_err(|_| PipelineError::QueueClosed(self.name))
    }

    /// Enqueue if a slot frees up within `timeout`; otherwise hand the item
    /// back.
    ///
    /// # Errors
    /// Returns the item if no slot was available in time or the queue is
    /// closed.
    pub async fn offer(&self, item: T, timeout: Duration) -> Result<(), T> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(slot)) => self
                .send(Leased { item, slot: QueueSlot { _permit: slot } })
                .map_err(Leased::into_inner),
            _ => Err(item),
        }
    }

    /// Enqueue only if a slot is free right now.
    ///
    /// # Errors
    /// Returns the item if the queue is full or closed.
    pub fn try_offer(&self, item: T) -> Result<(), T> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => self
                .send(Leased { item, slot: QueueSlot { _permit: slot } })
                .map_err(Leased::into_inner),
            Err(_) => Err(item),
        }
    }

    /// Put a leased item back at the tail without taking a new slot.
    ///
    /// # Errors
    /// [`PipelineError::QueueClosed`] if the queue was closed.
    pub fn requeue(&self, item: Leased<T>) -> Result<(), PipelineError> {
        self.send(item)
            .map_err(|_| PipelineError::QueueClosed(self.name))
    }

    /// Wait up to `timeout` for the next item.
    pub async fn poll(&self, timeout: Duration) -> Option<Leased<T>> {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(item)) => Some(item),
            _ => None,
        }
    }

    /// Items waiting in the channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no item is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Free slots. Items held by a consumer still occupy theirs.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.slots.available_permits()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every waiting item and return how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.drain().count()
    }

    /// Refuse further puts; producers waiting for a slot fail.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    fn send(&self, item: Leased<T>) -> Result<(), Leased<T>> {
        if self.slots.is_closed() {
            return Err(item);
        }
        self.tx.send(item).map_err(|flume::SendError(item)| item)
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// The two queues of the pipeline: fetched tasks awaiting probing, and
/// admitted tasks awaiting execution.
#[derive(Debug)]
pub struct PipelineQueues {
    probe: BoundedQueue<ProbeTask>,
    execute: BoundedQueue<ExecuteTask>,
}

impl PipelineQueues {
    /// Queues with the given capacities.
    #[must_use]
    pub fn new(probe_capacity: usize, execute_capacity: usize) -> Self {
        info!(probe_capacity, execute_capacity, "pipeline queues initialized");
        Self {
            probe: BoundedQueue::new("probe", probe_capacity),
            execute: BoundedQueue::new("execute", execute_capacity),
        }
    }

    /// Probe queue.
    #[must_use]
    pub const fn probe(&self) -> &BoundedQueue<ProbeTask> {
        &self.probe
    }

    /// Execute queue.
    #[must_use]
    pub const fn execute(&self) -> &BoundedQueue<ExecuteTask> {
        &self.execute
    }

    /// Blocking put onto the probe queue.
    ///
    /// # Errors
    /// Fails only if the queue is closed.
    pub async fn put_probe_task(&self, task: ProbeTask) -> Result<(), PipelineError> {
        self.probe.put(task).await
    }

    /// Put a probe task that was denied capacity back at the tail.
    ///
    /// # Errors
    /// Fails only if the queue is closed.
    pub fn requeue_probe_task(&self, task: Leased<ProbeTask>) -> Result<(), PipelineError> {
        self.probe.requeue(task)
    }

    /// Next probe task within `timeout`.
    pub async fn poll_probe_task(&self, timeout: Duration) -> Option<Leased<ProbeTask>> {
        self.probe.poll(timeout).await
    }

    /// Blocking put onto the execute queue.
    ///
    /// # Errors
    /// Fails only if the queue is closed.
    pub async fn put_execute_task(&self, task: ExecuteTask) -> Result<(), PipelineError> {
        self.execute.put(task).await
    }

    /// Next execute task within `timeout`; its slot is released on return.
    pub async fn poll_execute_task(&self, timeout: Duration) -> Option<ExecuteTask> {
        self.execute.poll(timeout).await.map(Leased::into_inner)
    }

    /// Items waiting in the probe queue.
    #[must_use]
    pub fn probe_queue_size(&self) -> usize {
        self.probe.len()
    }

    /// Items waiting in the execute queue.
    #[must_use]
    pub fn execute_queue_size(&self) -> usize {
        self.execute.len()
    }

    /// Free probe slots.
    #[must_use]
    pub fn probe_queue_remaining(&self) -> usize {
        self.probe.remaining_capacity()
    }

    /// Free execute slots.
    #[must_use]
    pub fn execute_queue_remaining(&self) -> usize {
        self.execute.remaining_capacity()
    }

    /// Close both queues to further puts.
    pub fn close(&self) {
        self.probe.close();
        self.execute.close();
    }

    /// Drop everything still queued. Dropped deliveries are left to the
    /// broker's ack-wait redelivery.
    pub fn clear_all(&self) -> (usize, usize) {
        let probe = self.probe.clear();
        let execute = self.execute.clear();
        if probe + execute > 0 {
            info!(probe, execute, "cleared queued tasks");
        }
        (probe, execute)
    }

    /// Log queue depths.
    pub fn log_status(&self) {
        info!(
            probe_len = self.probe.len(),
            probe_capacity = self.probe.capacity(),
            execute_len = self.execute.len(),
            execute_capacity = self.execute.capacity(),
            "queue status"
        );
    }
}
