//! Wires the stages together and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::core::{AppResult, HeartbeatManager, MessageSource, ResourceScheduler};
use crate::pipeline::{ExecutorStage, FetcherStage, PipelineQueues, ProberStage};

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Fetch loop running.
    pub fetcher_running: bool,
    /// Prober stage running.
    pub prober_running: bool,
    /// Live prober loops.
    pub prober_active_workers: usize,
    /// Executor dispatcher running.
    pub executor_running: bool,
    /// Executions in progress.
    pub executor_active_tasks: usize,
    /// Tasks waiting for probing.
    pub probe_queue_size: usize,
    /// Tasks waiting for execution.
    pub execute_queue_size: usize,
    /// Scheduler units in use.
    pub scheduler_usage: u32,
    /// Scheduler unit budget.
    pub scheduler_capacity: u32,
    /// Scheduler usage in percent.
    pub scheduler_usage_percentage: f64,
    /// Free probe queue slots.
    pub probe_queue_remaining: usize,
    /// Free execute queue slots.
    pub execute_queue_remaining: usize,
    /// Running heartbeats.
    pub active_heartbeats: usize,
    /// Keep-alive signals the broker refused.
    pub heartbeat_failed_ticks: u64,
    /// Messages pulled from the broker.
    pub messages_fetched: u64,
    /// Messages acknowledged without a task.
    pub messages_dropped: u64,
    /// Tasks promoted to execution.
    pub tasks_admitted: u64,
    /// Admission attempts requeued.
    pub tasks_requeued: u64,
    /// Executions acked after success.
    pub tasks_completed: u64,
    /// Executions nacked after failure.
    pub tasks_failed: u64,
    /// Executions acked after rejection.
    pub tasks_rejected: u64,
}

/// Owns the scheduler, queues, heartbeats and the three stages.
///
/// Start order is executor, prober, fetcher so that every consumer is
/// ready before its producer; shutdown runs the other way round.
pub struct PipelineOrchestrator {
    inner: Arc<Components>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Everything the orchestrator wires together.
pub(crate) struct Components {
    pub(crate) config: PipelineConfig,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) scheduler: ResourceScheduler,
    pub(crate) heartbeats: HeartbeatManager,
    pub(crate) queues: Arc<PipelineQueues>,
    pub(crate) fetcher: FetcherStage,
    pub(crate) prober: ProberStage,
    pub(crate) executor: ExecutorStage,
}

impl Components {
    fn stats(&self) -> PipelineStats {
        PipelineStats {
            fetcher_running: self.fetcher.is_running(),
            prober_running: self.prober.is_running(),
            prober_active_workers: self.prober.active_workers(),
            executor_running: self.executor.is_running(),
            executor_active_tasks: self.executor.active_tasks(),
            probe_queue_size: self.queues.probe_queue_size(),
            execute_queue_size: self.queues.execute_queue_size(),
            scheduler_usage: self.scheduler.current_usage(),
            scheduler_capacity: self.scheduler.max_capacity(),
            scheduler_usage_percentage: self.scheduler.usage_percentage(),
            probe_queue_remaining: self.queues.probe_queue_remaining(),
            execute_queue_remaining: self.queues.execute_queue_remaining(),
            active_heartbeats: self.heartbeats.active_heartbeat_count(),
            heartbeat_failed_ticks: self.heartbeats.failed_ticks(),
            messages_fetched: self.fetcher.messages_fetched(),
            messages_dropped: self.fetcher.messages_dropped(),
            tasks_admitted: self.prober.tasks_admitted(),
            tasks_requeued: self.prober.tasks_requeued(),
            tasks_completed: self.executor.tasks_completed(),
            tasks_failed: self.executor.tasks_failed(),
            tasks_rejected: self.executor.tasks_rejected(),
        }
    }
}

impl PipelineOrchestrator {
    pub(crate) fn new(components: Components) -> Self {
        Self {
            inner: Arc::new(components),
            monitor: Mutex::new(None),
        }
    }

    /// Configure the broker consumer and start every stage.
    ///
    /// The consumer's `max_ack_pending` is set to the scheduler capacity so
    /// the broker never hands out more messages than could ever be admitted.
    ///
    /// # Errors
    /// Consumer setup failure or a stage that is already running.
    pub async fn start(&self) -> AppResult<()> {
        let inner = &self.inner;
        let capacity = inner.scheduler.max_capacity();
        let options = inner.config.consumer_options(capacity);
        inner
            .source
            .configure_consumer(&options)
            .await
            .context("configure broker consumer")?;
        info!(
            durable = %options.durable,
            max_ack_pending = options.max_ack_pending,
            "broker consumer configured"
        );

        inner.executor.start().context("start executor")?;
        inner.prober.start().context("start prober")?;
        inner.fetcher.start().context("start fetcher")?;
        self.start_monitor();

        info!(
            capacity,
            prober_workers = inner.config.prober_workers,
            max_concurrent_executions = inner.executor.max_concurrent(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stop fetcher, prober and executor in that order, then heartbeats and
    /// the monitor, then close the queues and drop anything still in them.
    pub async fn shutdown(&self) {
        info!("pipeline shutting down");
        let inner = &self.inner;
        inner.fetcher.stop().await;
        inner.prober.stop().await;
        inner.executor.stop().await;
        inner.heartbeats.shutdown();

        let monitor = self.monitor.lock().take();
        if let Some((token, handle)) = monitor {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }

        inner.queues.close();
        inner.queues.clear_all();
        info!(usage = inner.scheduler.current_usage(), "pipeline stopped");
    }

    /// All stages are running.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.fetcher.is_running()
            && self.inner.prober.is_running()
            && self.inner.executor.is_running()
    }

    /// Snapshot of stage state, queue depths and counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }

    /// Log the current [`PipelineStats`].
    pub fn log_status(&self) {
        log_stats(&self.inner.stats());
        self.inner.queues.log_status();
    }

    /// Shared scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &ResourceScheduler {
        &self.inner.scheduler
    }

    /// Shared heartbeat manager.
    #[must_use]
    pub fn heartbeats(&self) -> &HeartbeatManager {
        &self.inner.heartbeats
    }

    /// Shared queues.
    #[must_use]
    pub fn queues(&self) -> &PipelineQueues {
        &self.inner.queues
    }

    /// Fetcher stage.
    #[must_use]
    pub fn fetcher(&self) -> &FetcherStage {
        &self.inner.fetcher
    }

    /// Prober stage.
    #[must_use]
    pub fn prober(&self) -> &ProberStage {
        &self.inner.prober
    }

    /// Executor stage.
    #[must_use]
    pub fn executor(&self) -> &ExecutorStage {
        &self.inner.executor
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn start_monitor(&self) {
        let Some(interval) = self.inner.config.monitor_interval() else {
            return;
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            interval,
            token.clone(),
            Arc::clone(&self.inner),
        ));
        if let Some((old, _)) = self.monitor.lock().replace((token, handle)) {
            old.cancel();
        }
    }
}

async fn monitor_loop(interval: Duration, token: CancellationToken, inner: Arc<Components>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => log_stats(&inner.stats()),
        }
    }
}

fn log_stats(stats: &PipelineStats) {
    info!(
        fetcher = stats.fetcher_running,
        prober = stats.prober_running,
        prober_workers = stats.prober_active_workers,
        executor = stats.executor_running,
        executing = stats.executor_active_tasks,
        probe_queue = stats.probe_queue_size,
        execute_queue = stats.execute_queue_size,
        usage = stats.scheduler_usage,
        capacity = stats.scheduler_capacity,
        probe_free = stats.probe_queue_remaining,
        execute_free = stats.execute_queue_remaining,
        heartbeats = stats.active_heartbeats,
        heartbeat_failures = stats.heartbeat_failed_ticks,
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        "pipeline status"
    );
}
