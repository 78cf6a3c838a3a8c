//! Prober stage: discovers each task's cost and waits, bounded, for
//! scheduler capacity.
//!
//! A task that cannot be admitted in time goes back to the tail of the probe
//! queue with its probe result cached, so the next attempt skips the probe
//! call. Requeueing never touches the broker: the delivery is carried over
//! undisposed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::{PipelineError, ProbeResult, ProbeService, ProbeTask};
use crate::pipeline::{Leased, StageContext, StageControl};
use crate::util::clock::elapsed_ms;

#[derive(Default)]
struct ProberCounters {
    probed: AtomicU64,
    admitted: AtomicU64,
    requeued: AtomicU64,
    probe_failures: AtomicU64,
}

struct ProberShared {
    ctx: StageContext,
    probe: Arc<dyn ProbeService>,
    acquire_timeout: Duration,
    poll_timeout: Duration,
    image_cost: u32,
    active_workers: AtomicUsize,
    counters: ProberCounters,
}

/// Fixed pool of prober loops.
pub struct ProberStage {
    shared: Arc<ProberShared>,
    control: StageControl,
    workers: usize,
    stop_timeout: Duration,
}

impl ProberStage {
    /// Build a stopped prober stage.
    #[must_use]
    pub fn new(config: &PipelineConfig, ctx: StageContext, probe: Arc<dyn ProbeService>) -> Self {
        Self {
            shared: Arc::new(ProberShared {
                ctx,
                probe,
                acquire_timeout: config.resource_acquire_timeout(),
                poll_timeout: config.probe_poll_timeout(),
                image_cost: config.image_cost.max(1),
                active_workers: AtomicUsize::new(0),
                counters: ProberCounters::default(),
            }),
            control: StageControl::new("prober"),
            workers: config.prober_workers.max(1),
            stop_timeout: config.stage_stop_timeout(),
        }
    }

    /// Spawn the worker loops.
    ///
    /// # Errors
    /// [`PipelineError::AlreadyRunning`] if started twice.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.control.start(|token, tasks| {
            for worker_id in 0..self.workers {
                let shared = Arc::clone(&self.shared);
                let token = token.clone();
                tasks.spawn(async move { shared.worker_loop(worker_id, token).await });
            }
        })
    }

    /// Stop the loops after their current task.
    pub async fn stop(&self) {
        self.control.stop(self.stop_timeout).await;
    }

    /// Whether the stage is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Worker loops currently alive.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Relaxed)
    }

    /// Probe calls made (cache hits and images excluded).
    #[must_use]
    pub fn tasks_probed(&self) -> u64 {
        self.shared.counters.probed.load(Ordering::Relaxed)
    }

    /// Tasks promoted to the execute queue.
    #[must_use]
    pub fn tasks_admitted(&self) -> u64 {
        self.shared.counters.admitted.load(Ordering::Relaxed)
    }

    /// Admission attempts that timed out and were requeued.
    #[must_use]
    pub fn tasks_requeued(&self) -> u64 {
        self.shared.counters.requeued.load(Ordering::Relaxed)
    }

    /// Probe failures (message nacked).
    #[must_use]
    pub fn probe_failures(&self) -> u64 {
        self.shared.counters.probe_failures.load(Ordering::Relaxed)
    }
}

impl ProberShared {
    async fn worker_loop(&self, worker_id: usize, token: CancellationToken) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id, "prober worker started");
        while !token.is_cancelled() {
            if let Some(task) = self.ctx.queues.poll_probe_task(self.poll_timeout).await {
                self.handle(worker_id, task, &token).await;
            }
        }
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
        debug!(worker_id, "prober worker stopped");
    }

    async fn handle(&self, worker_id: usize, leased: Leased<ProbeTask>, token: &CancellationToken) {
        let (task, slot) = leased.into_parts();
        let ProbeTask {
            delivery,
            object,
            enqueued_at_ms,
            attempts,
            cached_probe,
        } = task;
        let task_id = object.task_id();
        let heartbeat = self.ctx.heartbeats.start_heartbeat(&task_id, delivery);

        let probe = match cached_probe {
            Some(probe) => probe,
            None if object.purpose.is_video() => {
                self.counters.probed.fetch_add(1, Ordering::Relaxed);
                match self.probe.probe(&object.bucket, &object.key).await {
                    Ok(probe) => probe,
                    Err(e) => {
                        self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
                        error!(worker_id, task_id = %task_id, error = %e, "probe failed");
                        if let Err(e) = self.ctx.heartbeats.stop_and_nak(heartbeat).await {
                            warn!(task_id = %task_id, error = %e, "nak after probe failure failed");
                        }
                        return;
                    }
                }
            }
            None => ProbeResult::fixed(self.image_cost),
        };
        let cost = probe.peak_cost.max(1);
        debug!(worker_id, task_id = %task_id, cost, attempts, "requesting capacity");

        let granted = self
            .ctx
            .scheduler
            .try_acquire(cost, self.acquire_timeout)
            .await;
        let delivery = self.ctx.heartbeats.stop_heartbeat(heartbeat).await;
        let task = ProbeTask {
            delivery,
            object,
            enqueued_at_ms,
            attempts,
            cached_probe: None,
        };

        match granted {
            Some(resource) => {
                drop(slot);
                let units = resource.units();
                let queued_ms = elapsed_ms(task.enqueued_at_ms);
                let execute = task.admit(probe, resource);
                match self.ctx.queues.put_execute_task(execute).await {
                    Ok(()) => {
                        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                        info!(worker_id, task_id = %task_id, cost, units, attempts, queued_ms, "task admitted");
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "execute queue rejected task"),
                }
            }
            None => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker_id,
                    task_id = %task_id,
                    cost,
                    available = self.ctx.scheduler.available_capacity(),
                    attempts = attempts + 1,
                    "capacity unavailable; requeueing"
                );
                let requeued = Leased::from_parts(task.requeued(probe), slot);
                if let Err(e) = self.ctx.queues.requeue_probe_task(requeued) {
                    warn!(task_id = %task_id, error = %e, "requeue failed");
                }
                if self.ctx.scheduler.is_closed() {
                    // Closed schedulers deny instantly; avoid spinning on the same task.
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(self.poll_timeout) => {}
                    }
                }
            }
        }
    }
}
