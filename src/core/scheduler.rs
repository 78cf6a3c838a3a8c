//! Cost-weighted admission control.
//!
//! The scheduler owns a fixed budget of abstract resource units (roughly one
//! per worker thread). Jobs acquire `cost` units before they run and give
//! them back when they finish. Waiting is fair: a `tokio::sync::Semaphore`
//! serves acquirers strictly in arrival order, so a large request is not
//! overtaken by a stream of small ones while it waits. It only loses its
//! place when its own bounded wait times out.
//!
//! Units are tracked twice: the semaphore enforces the budget, and an
//! `AtomicU32` mirrors the units held so that stats never need a lock.
//! Grants bump the counter after the permit is obtained and releases lower
//! it before the permit is returned, so `current_usage()` never exceeds
//! `max_capacity()`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::core::PipelineError;

struct SchedulerState {
    semaphore: Arc<Semaphore>,
    max_capacity: u32,
    /// Units currently held by outstanding handles.
    active_units: AtomicU32,
    grants: AtomicU64,
    timeouts: AtomicU64,
}

impl SchedulerState {
    fn give_back(&self, permit: OwnedSemaphorePermit, units: u32) {
        self.active_units.fetch_sub(units, Ordering::AcqRel);
        drop(permit);
    }
}

/// Cost-weighted admission controller shared by the Prober and Executor.
#[derive(Clone)]
pub struct ResourceScheduler {
    state: Arc<SchedulerState>,
}

impl fmt::Debug for ResourceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScheduler")
            .field("max_capacity", &self.state.max_capacity)
            .field("current_usage", &self.current_usage())
            .finish()
    }
}

impl ResourceScheduler {
    /// Create a scheduler with a fixed unit budget. A zero budget is raised to 1.
    #[must_use]
    pub fn new(max_capacity: u32) -> Self {
        let max_capacity = max_capacity.max(1);
        info!(max_capacity, "resource scheduler initialized");
        Self {
            state: Arc::new(SchedulerState {
                semaphore: Arc::new(Semaphore::new(max_capacity as usize)),
                max_capacity,
                active_units: AtomicU32::new(0),
                grants: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        }
    }

    /// Wait up to `timeout` for `cost` units. Returns `None` if the wait
    /// timed out or the scheduler was closed.
    ///
    /// A cost larger than the whole budget is clamped to the budget; the
    /// returned handle reports the original `cost_weight` and the clamped
    /// `units`.
    ///
    /// # Panics
    /// Panics if `cost` is zero.
    pub async fn try_acquire(&self, cost: u32, timeout: Duration) -> Option<ResourceHandle> {
        let units = self.clamp(cost);
        let acquire = Arc::clone(&self.state.semaphore).acquire_many_owned(units);
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Some(self.grant(cost, units, permit)),
            Ok(Err(_)) => {
                debug!(cost, "scheduler closed while waiting for capacity");
                None
            }
            Err(_) => {
                self.state.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    cost,
                    units,
                    available = self.available_capacity(),
                    waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "capacity not available before timeout"
                );
                None
            }
        }
    }

    /// Wait without bound for `cost` units.
    ///
    /// # Errors
    /// Returns [`PipelineError::SchedulerClosed`] if the scheduler is closed
    /// while waiting.
    ///
    /// # Panics
    /// Panics if `cost` is zero.
    pub async fn acquire(&self, cost: u32) -> Result<ResourceHandle, PipelineError> {
        let units = self.clamp(cost);
        let permit = Arc::clone(&self.state.semaphore)
            .acquire_many_owned(units)
            .await
            .map_err(|_| PipelineError::SchedulerClosed)?;
        Ok(self.grant(cost, units, permit))
    }

    /// Return a handle's units to the budget. Taking the handle by value
    /// makes a second release of the same grant impossible.
    pub fn release(&self, mut handle: ResourceHandle) {
        debug_assert!(
            Arc::ptr_eq(&self.state, &handle.state),
            "handle released to a scheduler that did not grant it"
        );
        if let Some(permit) = handle.permit.take() {
            handle.state.give_back(permit, handle.units);
            debug!(
                cost = handle.cost_weight,
                units = handle.units,
                usage = self.current_usage(),
                "resources released"
            );
        }
    }

    /// Stop admitting: pending and future acquires resolve to `None`.
    /// Outstanding handles can still be released.
    pub fn close(&self) {
        self.state.semaphore.close();
        info!(usage = self.current_usage(), "resource scheduler closed");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.semaphore.is_closed()
    }

    /// Total unit budget. Also the broker's in-flight message ceiling.
    #[must_use]
    pub fn max_capacity(&self) -> u32 {
        self.state.max_capacity
    }

    /// Units currently held.
    #[must_use]
    pub fn current_usage(&self) -> u32 {
        self.state.active_units.load(Ordering::Acquire)
    }

    /// Units not currently held.
    #[must_use]
    pub fn available_capacity(&self) -> u32 {
        self.state.max_capacity.saturating_sub(self.current_usage())
    }

    /// Share of the budget in use, 0.0 to 100.0.
    #[must_use]
    pub fn usage_percentage(&self) -> f64 {
        f64::from(self.current_usage()) * 100.0 / f64::from(self.state.max_capacity)
    }

    /// Number of successful grants since creation.
    #[must_use]
    pub fn total_grants(&self) -> u64 {
        self.state.grants.load(Ordering::Relaxed)
    }

    /// Number of bounded waits that timed out since creation.
    #[must_use]
    pub fn total_timeouts(&self) -> u64 {
        self.state.timeouts.load(Ordering::Relaxed)
    }

    fn clamp(&self, cost: u32) -> u32 {
        assert!(cost > 0, "resource cost must be positive");
        if cost > self.state.max_capacity {
            debug!(
                cost,
                max_capacity = self.state.max_capacity,
                "cost exceeds capacity, clamping"
            );
        }
        cost.min(self.state.max_capacity)
    }

    fn grant(&self, cost: u32, units: u32, permit: OwnedSemaphorePermit) -> ResourceHandle {
        let usage = self.state.active_units.fetch_add(units, Ordering::AcqRel) + units;
        self.state.grants.fetch_add(1, Ordering::Relaxed);
        debug!(cost, units, usage, max = self.state.max_capacity, "resources acquired");
        ResourceHandle {
            permit: Some(permit),
            cost_weight: cost,
            units,
            state: Arc::clone(&self.state),
        }
    }
}

/// Units reserved for one job. Not `Clone`.
///
/// Give it back with [`ResourceScheduler::release`]. A handle dropped without
/// release (early return, panic unwinding) returns its units on drop and
/// logs a warning, so capacity cannot leak.
pub struct ResourceHandle {
    permit: Option<OwnedSemaphorePermit>,
    cost_weight: u32,
    units: u32,
    state: Arc<SchedulerState>,
}

impl ResourceHandle {
    /// Cost originally requested.
    #[must_use]
    pub const fn cost_weight(&self) -> u32 {
        self.cost_weight
    }

    /// Units actually held, i.e. the cost clamped to capacity. Processors use
    /// it as their thread budget.
    #[must_use]
    pub const fn units(&self) -> u32 {
        self.units
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("cost_weight", &self.cost_weight)
            .field("units", &self.units)
            .field("released", &self.permit.is_none())
            .finish()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            warn!(
                cost = self.cost_weight,
                units = self.units,
                "resource handle dropped without release; returning units"
            );
            self.state.give_back(permit, self.units);
        }
    }
}

/// Unit budget for a host with `logical_cpus` logical CPUs. Hosts with more
/// than four CPUs keep two back for the runtime and the broker client.
#[must_use]
pub fn detect_capacity(logical_cpus: usize) -> u32 {
    let reserved = if logical_cpus > 4 {
        logical_cpus - 2
    } else {
        logical_cpus
    };
    u32::try_from(reserved).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_detection_reserves_cores_on_large_hosts() {
        assert_eq!(detect_capacity(0), 1);
        assert_eq!(detect_capacity(4), 4);
        assert_eq!(detect_capacity(5), 3);
        assert_eq!(detect_capacity(16), 14);
    }

    #[tokio::test]
    async fn cost_above_capacity_is_clamped() {
        let scheduler = ResourceScheduler::new(10);
        let handle = scheduler
            .try_acquire(32, Duration::from_millis(50))
            .await
            .expect("clamped grant");
        assert_eq!(handle.cost_weight(), 32);
        assert_eq!(handle.units(), 10);
        assert_eq!(scheduler.current_usage(), 10);
        assert_eq!(scheduler.available_capacity(), 0);
        scheduler.release(handle);
        assert_eq!(scheduler.current_usage(), 0);
    }

    #[tokio::test]
    async fn try_acquire_times_out_when_exhausted() {
        let scheduler = ResourceScheduler::new(4);
        let held = scheduler.acquire(4).await.unwrap();
        let denied = scheduler.try_acquire(1, Duration::from_millis(20)).await;
        assert!(denied.is_none());
        assert_eq!(scheduler.total_timeouts(), 1);
        scheduler.release(held);
        let granted = scheduler.try_acquire(1, Duration::from_millis(20)).await;
        assert!(granted.is_some());
    }

    #[tokio::test]
    async fn dropped_handle_returns_units() {
        let scheduler = ResourceScheduler::new(8);
        {
            let _handle = scheduler.acquire(5).await.unwrap();
            assert_eq!(scheduler.current_usage(), 5);
        }
        assert_eq!(scheduler.current_usage(), 0);
        assert_eq!(scheduler.available_capacity(), 8);
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_acquires() {
        let scheduler = ResourceScheduler::new(2);
        let held = scheduler.acquire(2).await.unwrap();
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.try_acquire(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(matches!(
            scheduler.acquire(1).await,
            Err(PipelineError::SchedulerClosed)
        ));
        scheduler.release(held);
        assert_eq!(scheduler.current_usage(), 0);
    }

    #[test]
    #[should_panic(expected = "resource cost must be positive")]
    fn zero_cost_is_a_bug() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let scheduler = ResourceScheduler::new(2);
            let _ = scheduler.try_acquire(0, Duration::from_millis(1)).await;
        });
    }

    #[test]
    fn usage_percentage_tracks_held_units() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let scheduler = ResourceScheduler::new(8);
            let handle = scheduler.acquire(2).await.unwrap();
            assert!((scheduler.usage_percentage() - 25.0).abs() < f64::EPSILON);
            scheduler.release(handle);
        });
    }
}
