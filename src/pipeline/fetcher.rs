//! Fetcher stage: pulls notifications from the broker and turns them into
//! probe tasks.
//!
//! Anything that cannot become a task (non-creation events, missing or
//! unknown metadata, objects the store cannot stat, undecodable payloads) is
//! acknowledged and dropped, because redelivery would not fix it. The only
//! place the fetcher waits is the blocking put onto the probe queue, which
//! is how a saturated pipeline slows down broker pulls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::{
    Delivery, EventError, InboundMessage, MediaObject, MessageSource, ObjectStat, ObjectStore,
    PipelineError, ProbeTask, StorageError, UploadPurpose,
};
use crate::pipeline::event::{
    parse_notification, ObjectCreated, ParsedEvent, SkipReason, UploadMetadata,
};
use crate::pipeline::{PipelineQueues, StageControl};

/// Why a message was acknowledged without creating a task.
#[derive(Debug)]
enum Discard {
    Ignored(SkipReason),
    Malformed(EventError),
    MissingMetadata(UploadMetadata),
    UnknownPurpose(String),
    Unreachable(StorageError),
}

#[derive(Default)]
struct FetcherCounters {
    fetched: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    fetch_errors: AtomicU64,
}

struct FetcherShared {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn ObjectStore>,
    queues: Arc<PipelineQueues>,
    batch_size: usize,
    fetch_timeout: Duration,
    error_backoff: Duration,
    counters: FetcherCounters,
}

/// Single-loop stage feeding the probe queue.
pub struct FetcherStage {
    shared: Arc<FetcherShared>,
    control: StageControl,
    stop_timeout: Duration,
}

impl FetcherStage {
    /// Build a stopped fetcher.
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn MessageSource>,
        store: Arc<dyn ObjectStore>,
        queues: Arc<PipelineQueues>,
    ) -> Self {
        Self {
            shared: Arc::new(FetcherShared {
                source,
                store,
                queues,
                batch_size: config.fetch_batch_size.max(1),
                fetch_timeout: config.fetch_timeout(),
                error_backoff: config.fetch_error_backoff(),
                counters: FetcherCounters::default(),
            }),
            control: StageControl::new("fetcher"),
            stop_timeout: config.stage_stop_timeout(),
        }
    }

    /// Start the fetch loop.
    ///
    /// # Errors
    /// [`PipelineError::AlreadyRunning`] if started twice.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.control.start(|token, tasks| {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            tasks.spawn(async move { shared.fetch_loop(token).await });
        })
    }

    /// Stop the loop. A message whose put was interrupted is left to the
    /// broker's redelivery.
    pub async fn stop(&self) {
        self.control.stop(self.stop_timeout).await;
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Messages pulled from the broker.
    #[must_use]
    pub fn messages_fetched(&self) -> u64 {
        self.shared.counters.fetched.load(Ordering::Relaxed)
    }

    /// Probe tasks queued.
    #[must_use]
    pub fn tasks_queued(&self) -> u64 {
        self.shared.counters.queued.load(Ordering::Relaxed)
    }

    /// Messages acknowledged without a task.
    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.shared.counters.dropped.load(Ordering::Relaxed)
    }

    /// Failed broker pulls.
    #[must_use]
    pub fn fetch_errors(&self) -> u64 {
        self.shared.counters.fetch_errors.load(Ordering::Relaxed)
    }
}

impl FetcherShared {
    async fn fetch_loop(&self, token: CancellationToken) {
        info!(batch_size = self.batch_size, "fetch loop started");
        while !token.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                () = token.cancelled() => break,
                fetched = self.source.fetch(self.batch_size, self.fetch_timeout) => fetched,
            };
            match fetched {
                Ok(messages) => {
                    if !messages.is_empty() {
                        debug!(count = messages.len(), "fetched messages");
                    }
                    for message in messages {
                        self.counters.fetched.fetch_add(1, Ordering::Relaxed);
                        self.handle_message(message, &token).await;
                    }
                }
                Err(e) => {
                    self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, backoff = ?self.error_backoff, "fetch failed");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }
        info!("fetch loop stopped");
    }

    async fn handle_message(&self, message: InboundMessage, token: &CancellationToken) {
        let InboundMessage { payload, delivery } = message;
        match self.resolve(&payload).await {
            Ok(object) => self.enqueue(delivery, object, token).await,
            Err(reason) => self.drop_message(delivery, reason).await,
        }
    }

    async fn resolve(&self, payload: &[u8]) -> Result<MediaObject, Discard> {
        let event = match parse_notification(payload) {
            Ok(ParsedEvent::Created(event)) => event,
            Ok(ParsedEvent::Skip(reason)) => return Err(Discard::Ignored(reason)),
            Err(e) => return Err(Discard::Malformed(e)),
        };

        // Older stores omit user metadata from the event; fall back to stat.
        let mut stat = None;
        let mut metadata = event.metadata.clone();
        if !metadata.is_complete() {
            let found = self.stat(&event).await?;
            metadata = metadata.or(UploadMetadata::from_map(&found.user_metadata));
            stat = Some(found);
        }

        let (Some(raw_purpose), Some(upload_id)) =
            (metadata.purpose.clone(), metadata.upload_id.clone())
        else {
            return Err(Discard::MissingMetadata(metadata));
        };
        let purpose =
            UploadPurpose::parse(&raw_purpose).ok_or(Discard::UnknownPurpose(raw_purpose))?;

        let stat = match stat {
            Some(stat) => stat,
            None => self.stat(&event).await?,
        };
        Ok(MediaObject {
            bucket: event.bucket,
            key: event.key,
            purpose,
            upload_id,
            content_type: stat.content_type.or(event.content_type),
            size_bytes: stat.size,
        })
    }

    async fn stat(&self, event: &ObjectCreated) -> Result<ObjectStat, Discard> {
        self.store
            .stat_object(&event.bucket, &event.key)
            .await
            .map_err(Discard::Unreachable)
    }

    async fn enqueue(&self, delivery: Delivery, object: MediaObject, token: &CancellationToken) {
        let task_id = object.task_id();
        let purpose = object.purpose;
        let size = object.size_bytes;
        let task = ProbeTask::new(delivery, object);
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(task_id = %task_id, "fetcher stopped while waiting for probe queue space");
            }
            result = self.queues.put_probe_task(task) => match result {
                Ok(()) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    info!(task_id = %task_id, %purpose, size_bytes = size, "queued probe task");
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "probe queue rejected task"),
            }
        }
    }

    async fn drop_message(&self, delivery: Delivery, reason: Discard) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        let delivery_id = delivery.id().to_owned();
        match &reason {
            Discard::Ignored(skip) => debug!(delivery_id = %delivery_id, ?skip, "ignoring notification"),
            Discard::Malformed(e) => warn!(delivery_id = %delivery_id, error = %e, "malformed notification"),
            Discard::MissingMetadata(found) => warn!(
                delivery_id = %delivery_id,
                purpose = ?found.purpose,
                upload_id = ?found.upload_id,
                "missing required metadata"
            ),
            Discard::UnknownPurpose(purpose) => warn!(delivery_id = %delivery_id, %purpose, "unknown purpose"),
            Discard::Unreachable(e) => error!(delivery_id = %delivery_id, error = %e, "object stat failed"),
        }
        if let Err(e) = delivery.ack().await {
            warn!(delivery_id = %delivery_id, error = %e, "ack of dropped message failed");
        }
    }
}
