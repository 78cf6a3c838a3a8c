//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use media_admission_pipeline::builders::PipelineBuilder;
use media_admission_pipeline::config::PipelineConfig;
use media_admission_pipeline::core::{
    AppResult, MediaProcessor, ProbeError, ProbeResult, ProbeService, ProcessingJob,
    ProcessingResult, UploadPurpose,
};
use media_admission_pipeline::infra::{InMemoryBroker, InMemoryObjectStore, InMemoryStatusSink};
use media_admission_pipeline::pipeline::PipelineOrchestrator;

pub const BUCKET: &str = "uploads";

/// S3-style object-created notification with metadata in the event.
pub fn notification(key: &str, purpose: &str, upload_id: &str) -> serde_json::Value {
    json!({
        "Records": [{
            "eventName": "s3:ObjectCreated:Put",
            "s3": {
                "bucket": { "name": BUCKET },
                "object": {
                    "key": key,
                    "size": 4,
                    "userMetadata": {
                        "X-Amz-Meta-Purpose": purpose,
                        "X-Amz-Meta-Upload-Id": upload_id
                    }
                }
            }
        }]
    })
}

/// Poll `check` every 10 ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await `fut` with a generous ceiling so a hang fails instead of stalling.
pub async fn within<F: Future>(limit: Duration, fut: F) -> F::Output {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out after {limit:?}"))
}

/// Probe answering by object key; unknown keys are 1080p.
#[derive(Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<String, Result<ProbeResult, String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedProbe {
    pub fn answer(&self, key: &str, height: u32) {
        self.answers.lock().insert(
            key.to_owned(),
            Ok(ProbeResult::from_dimensions(height * 16 / 9, height, Some(60.0))),
        );
    }

    pub fn fail(&self, key: &str, reason: &str) {
        self.answers.lock().insert(key.to_owned(), Err(reason.to_owned()));
    }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProbeService for ScriptedProbe {
    async fn probe(&self, _bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
        *self.calls.lock().entry(key.to_owned()).or_default() += 1;
        match self.answers.lock().get(key).cloned() {
            Some(Ok(probe)) => Ok(probe),
            Some(Err(reason)) => Err(ProbeError::Unreadable(reason)),
            None => Ok(ProbeResult::from_dimensions(1920, 1080, Some(60.0))),
        }
    }
}

/// What the scripted processor does for an upload id.
#[derive(Clone)]
pub enum Behavior {
    Complete,
    Sleep(Duration),
    Fail(String),
    Error(String),
    Reject(String),
    Panic,
}

/// Processor whose outcome is chosen per upload id; default completes.
#[derive(Default)]
pub struct ScriptedProcessor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    processed: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    purposes: Vec<UploadPurpose>,
}

impl ScriptedProcessor {
    pub fn for_purposes(purposes: &[UploadPurpose]) -> Self {
        Self {
            purposes: purposes.to_vec(),
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::for_purposes(&[
            UploadPurpose::MovieSource,
            UploadPurpose::MovieTrailer,
            UploadPurpose::MoviePoster,
            UploadPurpose::UserAvatar,
        ])
    }

    pub fn set(&self, upload_id: &str, behavior: Behavior) {
        self.behaviors.lock().insert(upload_id.to_owned(), behavior);
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().clone()
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, purpose: UploadPurpose) -> bool {
        self.purposes.contains(&purpose)
    }

    async fn process(
        &self,
        job: &ProcessingJob,
        input: &Path,
        output_dir: &Path,
    ) -> AppResult<ProcessingResult> {
        assert!(input.exists(), "input must be downloaded before processing");
        assert!(output_dir.is_dir());
        let upload_id = job.object.upload_id.clone();
        self.processed.lock().push(upload_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .lock()
            .get(&upload_id)
            .cloned()
            .unwrap_or(Behavior::Complete);
        let result = match behavior {
            Behavior::Complete => Ok(ProcessingResult::Completed {
                duration_secs: job.probe.duration_secs,
            }),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(ProcessingResult::completed())
            }
            Behavior::Fail(reason) => Ok(ProcessingResult::failed(reason)),
            Behavior::Error(reason) => Err(anyhow::anyhow!(reason)),
            Behavior::Reject(reason) => Ok(ProcessingResult::rejected(
                media_admission_pipeline::core::RejectionKind::InvalidFile,
                reason,
            )),
            Behavior::Panic => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("processor blew up");
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A pipeline wired to in-memory collaborators.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub store: InMemoryObjectStore,
    pub status: InMemoryStatusSink,
    pub probe: Arc<ScriptedProbe>,
    pub processor: Arc<ScriptedProcessor>,
    pub pipeline: PipelineOrchestrator,
    pub workdirs: TempDir,
}

/// Short timeouts so tests run in well under a second per step.
pub fn fast_config(capacity: u32, workdirs: &Path) -> PipelineConfig {
    PipelineConfig::default()
        .with_max_capacity(capacity)
        .with_resource_acquire_timeout(Duration::from_millis(100))
        .with_poll_timeout(Duration::from_millis(20))
        .with_fetch(5, Duration::from_millis(50))
        .with_fetch_error_backoff(Duration::from_millis(20))
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_monitor_interval(Duration::ZERO)
        .with_stage_stop_timeout(Duration::from_secs(2))
        .with_temp_dir(workdirs)
}

impl Harness {
    pub fn new(capacity: u32) -> Self {
        Self::with_config(|cfg| cfg, capacity, ScriptedProcessor::all())
    }

    pub fn with_config(
        tweak: impl FnOnce(PipelineConfig) -> PipelineConfig,
        capacity: u32,
        processor: ScriptedProcessor,
    ) -> Self {
        media_admission_pipeline::util::init_test_tracing();
        let workdirs = tempfile::tempdir().expect("tempdir");
        let broker = InMemoryBroker::new();
        let store = InMemoryObjectStore::new();
        let status = InMemoryStatusSink::new();
        let probe = Arc::new(ScriptedProbe::default());
        let processor = Arc::new(processor);

        let config = tweak(fast_config(capacity, workdirs.path()));
        let pipeline = PipelineBuilder::new(config)
            .with_message_source(Arc::new(broker.clone()))
            .with_object_store(Arc::new(store.clone()))
            .with_probe_service(probe.clone())
            .with_processor(processor.clone())
            .with_status_sink(Arc::new(status.clone()))
            .build()
            .expect("pipeline builds");

        Self {
            broker,
            store,
            status,
            probe,
            processor,
            pipeline,
            workdirs,
        }
    }

    /// Store an object and push its notification; returns the message id.
    pub fn upload(&self, key: &str, purpose: &str, upload_id: &str) -> u64 {
        self.store.put_object(BUCKET, key, b"data".to_vec(), None, &[]);
        self.broker.push_json(&notification(key, purpose, upload_id))
    }

    /// Wait until the message got at least one ack.
    pub async fn acked(&self, message_id: u64) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.broker.record(message_id).is_some_and(|r| r.acks >= 1)
        })
        .await
    }

    /// Wait until the message got at least one nak.
    pub async fn nacked(&self, message_id: u64) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.broker.record(message_id).is_some_and(|r| r.naks >= 1)
        })
        .await
    }

    /// Wait until the scheduler is back to zero usage.
    pub async fn idle(&self) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.pipeline.scheduler().current_usage() == 0
                && self.pipeline.executor().active_tasks() == 0
        })
        .await
    }

    /// Working directories left behind under the temp root.
    pub fn leftover_workdirs(&self) -> usize {
        let root = self.pipeline.config().effective_temp_dir();
        std::fs::read_dir(root).map_or(0, |entries| entries.count())
    }
}
