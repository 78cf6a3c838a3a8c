//! The three pipeline stages, their queues and the orchestrator.
//!
//! ```text
//! broker --> Fetcher --> [probe queue] --> Prober --> [execute queue] --> Executor
//!                              ^              |
//!                              +-- requeue ---+   (no capacity yet)
//! ```

pub mod event;
pub mod executor;
pub mod fetcher;
pub mod orchestrator;
pub mod prober;
pub mod queues;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::{HeartbeatManager, PipelineError, ResourceScheduler};

pub use event::{parse_notification, ObjectCreated, ParsedEvent, SkipReason, UploadMetadata};
pub use executor::ExecutorStage;
pub use fetcher::FetcherStage;
pub use orchestrator::{PipelineOrchestrator, PipelineStats};
pub use prober::ProberStage;
pub use queues::{BoundedQueue, Leased, PipelineQueues, QueueSlot};

/// Components every stage shares.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Admission control.
    pub scheduler: ResourceScheduler,
    /// Keep-alives for in-flight messages.
    pub heartbeats: HeartbeatManager,
    /// Hand-off queues.
    pub queues: Arc<PipelineQueues>,
}

struct StageRun {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

/// Running/stopped state of a stage and the tasks it spawned.
pub(crate) struct StageControl {
    name: &'static str,
    run: Mutex<Option<StageRun>>,
}

impl StageControl {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            run: Mutex::new(None),
        }
    }

    /// Spawn the stage's loops. Fails if the stage is already running.
    pub(crate) fn start<F>(&self, spawn: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&CancellationToken, &mut JoinSet<()>),
    {
        let mut run = self.run.lock();
        if run.is_some() {
            return Err(PipelineError::AlreadyRunning(self.name));
        }
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();
        spawn(&token, &mut tasks);
        info!(stage = self.name, loops = tasks.len(), "stage started");
        *run = Some(StageRun { token, tasks });
        Ok(())
    }

    /// Signal the loops to stop and wait up to `grace` for them; abort
    /// whatever is left after that.
    pub(crate) async fn stop(&self, grace: Duration) {
        let taken = self.run.lock().take();
        let Some(mut run) = taken else {
            return;
        };
        info!(stage = self.name, "stopping stage");
        run.token.cancel();

        let name = self.name;
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = run.tasks.join_next().await {
                report_join(name, result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                stage = self.name,
                remaining = run.tasks.len(),
                "stage did not stop in time; aborting"
            );
            run.tasks.abort_all();
            while run.tasks.join_next().await.is_some() {}
        }
        info!(stage = self.name, "stage stopped");
    }

    pub(crate) fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.token.is_cancelled())
    }
}

pub(crate) fn report_join(stage: &'static str, result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(stage, error = %e, "stage task panicked");
        }
    }
}

/// Text of a panic payload carried by a [`JoinError`].
pub(crate) fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned()),
        Err(err) => err.to_string(),
    }
}
