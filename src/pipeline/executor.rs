//! Executor stage: runs admitted tasks.
//!
//! A dispatcher loop pulls from the execute queue and spawns one tokio task
//! per [`ExecuteTask`], up to `max_concurrent_executions` at a time. Every
//! task acks before it publishes `COMPLETED`, naks on any failure, and always
//! releases its scheduler units and removes its working directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::{
    AppResult, ExecuteTask, HeartbeatHandle, ObjectStore, PipelineError, ProcessingJob,
    ProcessingResult, ProcessorRegistry, StatusPublisher,
};
use crate::pipeline::{panic_message, report_join, StageContext, StageControl};

#[derive(Default)]
struct ExecutorCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct ExecutorShared {
    ctx: StageContext,
    store: Arc<dyn ObjectStore>,
    processors: ProcessorRegistry,
    status: StatusPublisher,
    temp_root: PathBuf,
    poll_timeout: Duration,
    limit: Arc<Semaphore>,
    active: AtomicUsize,
    counters: ExecutorCounters,
}

/// Elastic pool of execution tasks.
pub struct ExecutorStage {
    shared: Arc<ExecutorShared>,
    control: StageControl,
    max_concurrent: usize,
    stop_timeout: Duration,
}

impl ExecutorStage {
    /// Build a stopped executor.
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        ctx: StageContext,
        store: Arc<dyn ObjectStore>,
        processors: ProcessorRegistry,
        status: StatusPublisher,
    ) -> Self {
        let max_concurrent =
            config.effective_max_concurrent_executions(ctx.scheduler.max_capacity());
        Self {
            shared: Arc::new(ExecutorShared {
                ctx,
                store,
                processors,
                status,
                temp_root: config.effective_temp_dir(),
                poll_timeout: config.execute_poll_timeout(),
                limit: Arc::new(Semaphore::new(max_concurrent)),
                active: AtomicUsize::new(0),
                counters: ExecutorCounters::default(),
            }),
            control: StageControl::new("executor"),
            max_concurrent,
            stop_timeout: config.stage_stop_timeout(),
        }
    }

    /// Start the dispatcher.
    ///
    /// # Errors
    /// [`PipelineError::AlreadyRunning`] if started twice.
    pub fn start(&self) -> Result<(), PipelineError> {
        info!(max_concurrent = self.max_concurrent, "starting executor");
        self.control.start(|token, tasks| {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            tasks.spawn(async move { shared.dispatch_loop(token).await });
        })
    }

    /// Stop taking new tasks and wait for running ones up to the stage stop
    /// timeout; tasks still running after that are aborted and their
    /// messages left to broker redelivery.
    pub async fn stop(&self) {
        self.control.stop(self.stop_timeout).await;
    }

    /// Whether the dispatcher is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Executions in progress.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Execution ceiling.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Tasks acked after success.
    #[must_use]
    pub fn tasks_completed(&self) -> u64 {
        self.shared.counters.completed.load(Ordering::Relaxed)
    }

    /// Tasks nacked after a failure.
    #[must_use]
    pub fn tasks_failed(&self) -> u64 {
        self.shared.counters.failed.load(Ordering::Relaxed)
    }

    /// Tasks acked after a permanent rejection.
    #[must_use]
    pub fn tasks_rejected(&self) -> u64 {
        self.shared.counters.rejected.load(Ordering::Relaxed)
    }
}

impl ExecutorShared {
    async fn dispatch_loop(self: Arc<Self>, token: CancellationToken) {
        let mut running = JoinSet::new();
        while !token.is_cancelled() {
            while let Some(result) = running.try_join_next() {
                report_join("executor", result);
            }
            let permit = tokio::select! {
                biased;
                () = token.cancelled() => break,
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let Some(task) = self.ctx.queues.poll_execute_task(self.poll_timeout).await else {
                continue;
            };
            let shared = Arc::clone(&self);
            running.spawn(async move {
                let _permit = permit;
                shared.active.fetch_add(1, Ordering::Relaxed);
                shared.run(task).await;
                shared.active.fetch_sub(1, Ordering::Relaxed);
            });
        }

        if !running.is_empty() {
            info!(in_flight = running.len(), "waiting for running executions");
        }
        while let Some(result) = running.join_next().await {
            report_join("executor", result);
        }
    }

    async fn run(&self, task: ExecuteTask) {
        let (delivery, resource, job) = task.into_parts();
        let task_id = job.object.task_id();
        let upload_id = job.object.upload_id.clone();
        let mut heartbeat = Some(self.ctx.heartbeats.start_heartbeat(&task_id, delivery));
        let started = Instant::now();
        info!(task_id = %task_id, upload_id = %upload_id, threads = job.threads, "execution started");

        self.status.publish_processing(&upload_id).await;
        let outcome = self.process(job).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(ProcessingResult::Completed { duration_secs }) => {
                if let Some(heartbeat) = heartbeat.take() {
                    if let Err(e) = self.ctx.heartbeats.stop_and_ack(heartbeat).await {
                        warn!(task_id = %task_id, error = %e, "ack after success failed");
                    }
                }
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %task_id, upload_id = %upload_id, elapsed_ms, "execution completed");
                self.status.publish_completed(&upload_id, duration_secs).await;
            }
            Ok(ProcessingResult::Rejected { kind, reason }) => {
                if let Some(heartbeat) = heartbeat.take() {
                    if let Err(e) = self.ctx.heartbeats.stop_and_ack(heartbeat).await {
                        warn!(task_id = %task_id, error = %e, "ack after rejection failed");
                    }
                }
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task_id, upload_id = %upload_id, ?kind, %reason, "input rejected");
                self.status.publish_rejected(&upload_id, kind, &reason).await;
            }
            Ok(ProcessingResult::Failed { reason }) => {
                self.fail(heartbeat.take(), &task_id, &upload_id, &reason).await;
            }
            Err(e) => {
                let reason = format!("{e:#}");
                self.fail(heartbeat.take(), &task_id, &upload_id, &reason).await;
            }
        }

        self.ctx.scheduler.release(resource);
    }

    async fn fail(
        &self,
        heartbeat: Option<HeartbeatHandle>,
        task_id: &str,
        upload_id: &str,
        reason: &str,
    ) {
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = self.ctx.heartbeats.stop_and_nak(heartbeat).await {
                warn!(task_id, error = %e, "nak after failure failed");
            }
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(task_id, upload_id, %reason, "execution failed");
        self.status.publish_failed(upload_id, reason).await;
    }

    /// Working directory, download and processor call. The directory is
    /// removed whatever the outcome.
    async fn process(&self, job: ProcessingJob) -> AppResult<ProcessingResult> {
        let workdir = self.create_workdir(&job.object.upload_id).await?;
        let result = self.process_in(workdir.path(), job).await;
        remove_workdir(workdir).await;
        result
    }

    async fn process_in(&self, workdir: &Path, job: ProcessingJob) -> AppResult<ProcessingResult> {
        let input = workdir.join(format!("input{}", job.object.extension()));
        let output = workdir.join("output");
        tokio::fs::create_dir_all(&output)
            .await
            .context("create output directory")?;

        let bytes = self
            .store
            .download_to_file(&job.object.bucket, &job.object.key, &input)
            .await
            .with_context(|| format!("download {}", job.object.task_id()))?;
        debug!(task_id = %job.object.task_id(), bytes, "source downloaded");

        let processor = self
            .processors
            .processor_for(job.object.purpose)
            .ok_or_else(|| anyhow!("no processor for purpose {}", job.object.purpose))?;
        debug!(task_id = %job.object.task_id(), processor = processor.name(), "invoking processor");

        // Run on its own task so a panicking processor surfaces as a failure.
        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            processor.process(&job, &input, &output).await
        }));
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("processor panicked: {}", panic_message(e))),
            Err(e) => Err(anyhow!("processor task cancelled: {e}")),
        }
    }

    async fn create_workdir(&self, upload_id: &str) -> AppResult<TempDir> {
        let root = self.temp_root.clone();
        let prefix = format!("{}_", sanitize(upload_id));
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            tempfile::Builder::new().prefix(&prefix).tempdir_in(&root)
        })
        .await
        .context("working directory task")?
        .context("create working directory")
    }
}

async fn remove_workdir(workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || workdir.close()).await {
        Ok(Ok(())) => debug!(path = %path.display(), "working directory removed"),
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "working directory cleanup failed"),
        Err(e) => warn!(path = %path.display(), error = %e, "working directory cleanup task failed"),
    }
}

fn sanitize(upload_id: &str) -> String {
    upload_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::sanitize;

    #[test]
    fn workdir_prefix_is_filesystem_safe() {
        assert_eq!(sanitize("u-1/../x y"), "u-1____x_y");
    }
}
