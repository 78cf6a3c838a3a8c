//! Pipeline configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{detect_capacity, ConsumerOptions};

/// Durable consumer settings for the notification stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Stream name.
    pub stream: String,
    /// Subject filter.
    pub subject: String,
    /// Durable consumer name.
    pub durable: String,
    /// Broker ack-wait in milliseconds.
    pub ack_wait_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let defaults = ConsumerOptions::default();
        Self {
            stream: defaults.stream,
            subject: defaults.subject,
            durable: defaults.durable,
            ack_wait_ms: duration_ms(defaults.ack_wait),
        }
    }
}

/// Configuration for one pipeline instance.
///
/// Every field has a default, so a partial JSON document or a handful of
/// `PIPELINE_*` environment variables is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scheduler unit budget; 0 sizes it from the CPU count.
    pub max_capacity: u32,
    /// Probe queue capacity.
    pub probe_queue_capacity: usize,
    /// Execute queue capacity.
    pub execute_queue_capacity: usize,
    /// Number of prober loops.
    pub prober_workers: usize,
    /// Ceiling on concurrently running executions; 0 means scheduler capacity.
    pub max_concurrent_executions: usize,
    /// Bounded wait for scheduler capacity per admission attempt.
    pub resource_acquire_timeout_ms: u64,
    /// Probe queue poll timeout.
    pub probe_poll_timeout_ms: u64,
    /// Execute queue poll timeout.
    pub execute_poll_timeout_ms: u64,
    /// Messages per broker pull.
    pub fetch_batch_size: usize,
    /// Bounded wait per broker pull.
    pub fetch_timeout_ms: u64,
    /// Sleep after a failed broker pull.
    pub fetch_error_backoff_ms: u64,
    /// Interval between keep-alive signals.
    pub heartbeat_interval_ms: u64,
    /// Parent of per-task working directories; `None` uses the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Interval of the status log; 0 disables it.
    pub monitor_interval_ms: u64,
    /// How long a stage waits for in-flight work on stop.
    pub stage_stop_timeout_ms: u64,
    /// Fixed cost of image tasks, which are never probed.
    pub image_cost: u32,
    /// Subject for status events.
    pub status_subject: String,
    /// Broker consumer settings.
    pub consumer: ConsumerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_capacity: 0,
            probe_queue_capacity: 100,
            execute_queue_capacity: 50,
            prober_workers: 5,
            max_concurrent_executions: 0,
            resource_acquire_timeout_ms: 10_000,
            probe_poll_timeout_ms: 500,
            execute_poll_timeout_ms: 500,
            fetch_batch_size: 5,
            fetch_timeout_ms: 2_000,
            fetch_error_backoff_ms: 1_000,
            heartbeat_interval_ms: 30_000,
            temp_dir: None,
            monitor_interval_ms: 30_000,
            stage_stop_timeout_ms: 30_000,
            image_cost: 1,
            status_subject: "media.status.update".into(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler budget.
    #[must_use]
    pub const fn with_max_capacity(mut self, units: u32) -> Self {
        self.max_capacity = units;
        self
    }

    /// Set both queue capacities.
    #[must_use]
    pub const fn with_queue_capacities(mut self, probe: usize, execute: usize) -> Self {
        self.probe_queue_capacity = probe;
        self.execute_queue_capacity = execute;
        self
    }

    /// Set the number of prober loops.
    #[must_use]
    pub const fn with_prober_workers(mut self, workers: usize) -> Self {
        self.prober_workers = workers;
        self
    }

    /// Set the execution ceiling.
    #[must_use]
    pub const fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    /// Set the admission wait.
    #[must_use]
    pub fn with_resource_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.resource_acquire_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set both queue poll timeouts.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.probe_poll_timeout_ms = duration_ms(timeout);
        self.execute_poll_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set broker pull batch size and wait.
    #[must_use]
    pub fn with_fetch(mut self, batch_size: usize, timeout: Duration) -> Self {
        self.fetch_batch_size = batch_size;
        self.fetch_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the backoff after a failed pull.
    #[must_use]
    pub fn with_fetch_error_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_error_backoff_ms = duration_ms(backoff);
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    /// Set the working directory parent.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the status log interval; zero disables it.
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = duration_ms(interval);
        self
    }

    /// Set the stage stop timeout.
    #[must_use]
    pub fn with_stage_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stage_stop_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the fixed image cost.
    #[must_use]
    pub const fn with_image_cost(mut self, cost: u32) -> Self {
        self.image_cost = cost;
        self
    }

    /// Set the broker ack-wait.
    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.consumer.ack_wait_ms = duration_ms(ack_wait);
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("probe_queue_capacity", self.probe_queue_capacity as u64),
            ("execute_queue_capacity", self.execute_queue_capacity as u64),
            ("prober_workers", self.prober_workers as u64),
            ("fetch_batch_size", self.fetch_batch_size as u64),
            ("resource_acquire_timeout_ms", self.resource_acquire_timeout_ms),
            ("probe_poll_timeout_ms", self.probe_poll_timeout_ms),
            ("execute_poll_timeout_ms", self.execute_poll_timeout_ms),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("stage_stop_timeout_ms", self.stage_stop_timeout_ms),
            ("consumer.ack_wait_ms", self.consumer.ack_wait_ms),
            ("image_cost", u64::from(self.image_cost)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if self.status_subject.trim().is_empty() {
            return Err("status_subject must not be empty".into());
        }
        if self.consumer.durable.trim().is_empty() {
            return Err("consumer.durable must not be empty".into());
        }
        if self.heartbeat_interval_ms >= self.consumer.ack_wait_ms {
            return Err("heartbeat_interval_ms must be shorter than consumer.ack_wait_ms".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `PIPELINE_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// # Errors
    /// A variable that does not parse, or validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        override_from_env(&mut cfg.max_capacity, "PIPELINE_MAX_CAPACITY")?;
        override_from_env(&mut cfg.probe_queue_capacity, "PIPELINE_PROBE_QUEUE_CAPACITY")?;
        override_from_env(&mut cfg.execute_queue_capacity, "PIPELINE_EXECUTE_QUEUE_CAPACITY")?;
        override_from_env(&mut cfg.prober_workers, "PIPELINE_PROBER_WORKERS")?;
        override_from_env(
            &mut cfg.max_concurrent_executions,
            "PIPELINE_MAX_CONCURRENT_EXECUTIONS",
        )?;
        override_from_env(
            &mut cfg.resource_acquire_timeout_ms,
            "PIPELINE_RESOURCE_ACQUIRE_TIMEOUT_MS",
        )?;
        override_from_env(&mut cfg.probe_poll_timeout_ms, "PIPELINE_PROBE_POLL_TIMEOUT_MS")?;
        override_from_env(
            &mut cfg.execute_poll_timeout_ms,
            "PIPELINE_EXECUTE_POLL_TIMEOUT_MS",
        )?;
        override_from_env(&mut cfg.fetch_batch_size, "PIPELINE_FETCH_BATCH_SIZE")?;
        override_from_env(&mut cfg.fetch_timeout_ms, "PIPELINE_FETCH_TIMEOUT_MS")?;
        override_from_env(&mut cfg.fetch_error_backoff_ms, "PIPELINE_FETCH_ERROR_BACKOFF_MS")?;
        override_from_env(&mut cfg.heartbeat_interval_ms, "PIPELINE_HEARTBEAT_INTERVAL_MS")?;
        override_from_env(&mut cfg.monitor_interval_ms, "PIPELINE_MONITOR_INTERVAL_MS")?;
        override_from_env(&mut cfg.stage_stop_timeout_ms, "PIPELINE_STAGE_STOP_TIMEOUT_MS")?;
        override_from_env(&mut cfg.image_cost, "PIPELINE_IMAGE_COST")?;
        override_from_env(&mut cfg.status_subject, "PIPELINE_STATUS_SUBJECT")?;
        override_from_env(&mut cfg.consumer.stream, "PIPELINE_STREAM")?;
        override_from_env(&mut cfg.consumer.subject, "PIPELINE_SUBJECT")?;
        override_from_env(&mut cfg.consumer.durable, "PIPELINE_DURABLE")?;
        override_from_env(&mut cfg.consumer.ack_wait_ms, "PIPELINE_ACK_WAIT_MS")?;
        if let Ok(dir) = std::env::var("PIPELINE_TEMP_DIR") {
            cfg.temp_dir = Some(PathBuf::from(dir));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Scheduler budget after auto-detection.
    #[must_use]
    pub fn effective_capacity(&self) -> u32 {
        if self.max_capacity == 0 {
            detect_capacity(num_cpus::get())
        } else {
            self.max_capacity
        }
    }

    /// Execution ceiling after defaulting to `capacity`.
    #[must_use]
    pub fn effective_max_concurrent_executions(&self, capacity: u32) -> usize {
        if self.max_concurrent_executions == 0 {
            capacity.max(1) as usize
        } else {
            self.max_concurrent_executions
        }
    }

    /// Parent directory for working directories.
    #[must_use]
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("media-pipeline"))
    }

    /// Consumer options for a scheduler of `capacity` units.
    #[must_use]
    pub fn consumer_options(&self, capacity: u32) -> ConsumerOptions {
        ConsumerOptions {
            stream: self.consumer.stream.clone(),
            subject: self.consumer.subject.clone(),
            durable: self.consumer.durable.clone(),
            ack_wait: Duration::from_millis(self.consumer.ack_wait_ms),
            max_ack_pending: capacity,
        }
    }

    /// Admission wait.
    #[must_use]
    pub const fn resource_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_acquire_timeout_ms)
    }

    /// Probe queue poll timeout.
    #[must_use]
    pub const fn probe_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_poll_timeout_ms)
    }

    /// Execute queue poll timeout.
    #[must_use]
    pub const fn execute_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_poll_timeout_ms)
    }

    /// Broker pull wait.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Backoff after a failed pull.
    #[must_use]
    pub const fn fetch_error_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_error_backoff_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Status log interval, if enabled.
    #[must_use]
    pub const fn monitor_interval(&self) -> Option<Duration> {
        if self.monitor_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.monitor_interval_ms))
        }
    }

    /// Stage stop timeout.
    #[must_use]
    pub const fn stage_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_stop_timeout_ms)
    }
}

fn override_from_env<T>(slot: &mut T, name: &str) -> Result<(), String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| format!("{name}={raw:?} is invalid: {e}"))?;
    }
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
