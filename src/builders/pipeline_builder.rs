//! Builder wiring a [`PipelineOrchestrator`] from configuration and
//! collaborators.

use std::sync::Arc;

use tracing::info;

use crate::config::PipelineConfig;
use crate::core::{
    HeartbeatManager, MediaProcessor, MessageSource, ObjectStore, PipelineError, ProbeService,
    ProcessorRegistry, Publisher, ResourceScheduler, StatusPublisher, StatusSink,
};
use crate::infra::SubjectStatusSink;
use crate::pipeline::orchestrator::Components;
use crate::pipeline::{
    ExecutorStage, FetcherStage, PipelineOrchestrator, PipelineQueues, ProberStage, StageContext,
};

/// Collects collaborators and builds the pipeline.
///
/// Message source, object store, probe service and status sink are
/// required; processors may be empty (every execution then fails and is
/// nacked).
pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn MessageSource>>,
    store: Option<Arc<dyn ObjectStore>>,
    probe: Option<Arc<dyn ProbeService>>,
    status: Option<Arc<dyn StatusSink>>,
    processors: ProcessorRegistry,
    scheduler: Option<ResourceScheduler>,
}

impl PipelineBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            store: None,
            probe: None,
            status: None,
            processors: ProcessorRegistry::new(),
            scheduler: None,
        }
    }

    /// Broker consumer.
    #[must_use]
    pub fn with_message_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Object store holding uploads.
    #[must_use]
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Media probe used for video cost discovery.
    #[must_use]
    pub fn with_probe_service(mut self, probe: Arc<dyn ProbeService>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replace the processor registry.
    #[must_use]
    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Register one more processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn MediaProcessor>) -> Self {
        self.processors.register(processor);
        self
    }

    /// Status transport.
    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    /// Publish status as JSON on the configured status subject.
    #[must_use]
    pub fn with_status_publisher(self, publisher: Arc<dyn Publisher>) -> Self {
        let subject = self.config.status_subject.clone();
        self.with_status_sink(Arc::new(SubjectStatusSink::new(publisher, subject)))
    }

    /// Use an existing scheduler instead of sizing one from the config.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: ResourceScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validate the configuration and wire every component.
    ///
    /// # Errors
    /// [`PipelineError::Config`] for an invalid configuration or a missing
    /// collaborator.
    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        self.config.validate().map_err(PipelineError::Config)?;
        let source = required(self.source, "message source")?;
        let store = required(self.store, "object store")?;
        let probe = required(self.probe, "probe service")?;
        let status = StatusPublisher::new(required(self.status, "status sink")?);
        let config = self.config;

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| ResourceScheduler::new(config.effective_capacity()));
        let heartbeats = HeartbeatManager::new(config.heartbeat_interval());
        let queues = Arc::new(PipelineQueues::new(
            config.probe_queue_capacity,
            config.execute_queue_capacity,
        ));
        let ctx = StageContext {
            scheduler: scheduler.clone(),
            heartbeats: heartbeats.clone(),
            queues: Arc::clone(&queues),
        };

        let fetcher = FetcherStage::new(&config, Arc::clone(&source), store.clone(), Arc::clone(&queues));
        let prober = ProberStage::new(&config, ctx.clone(), probe);
        let executor = ExecutorStage::new(&config, ctx, store, self.processors, status);

        info!(
            capacity = scheduler.max_capacity(),
            probe_queue = config.probe_queue_capacity,
            execute_queue = config.execute_queue_capacity,
            "pipeline built"
        );

        Ok(PipelineOrchestrator::new(Components {
            config,
            source,
            scheduler,
            heartbeats,
            queues,
            fetcher,
            prober,
            executor,
        }))
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, PipelineError> {
    value.ok_or_else(|| PipelineError::Config(format!("{what} not set")))
}
