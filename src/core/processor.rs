//! Probe and processor collaborator traits.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AppResult, ProbeError, ProbeResult, ProcessingJob, UploadPurpose};

/// Discovers resolution and peak cost of a video before admission.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use media_admission_pipeline::core::{ProbeError, ProbeResult, ProbeService};
///
/// struct FfprobeService;
///
/// #[async_trait]
/// impl ProbeService for FfprobeService {
///     async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
///         let (width, height, duration) = run_ffprobe(bucket, key).await?;
///         Ok(ProbeResult::from_dimensions(width, height, Some(duration)))
///     }
/// }
/// ```
#[async_trait]
pub trait ProbeService: Send + Sync {
    /// Probe the object in place (typically over a presigned URL).
    ///
    /// # Errors
    ///
    /// Any error is treated as a processing failure: the message is
    /// negatively acknowledged and the broker redelivers it.
    async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError>;
}

/// Why a processor refused an input outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// A malware scan flagged the file.
    MalwareDetected,
    /// The file is not valid media for its purpose.
    InvalidFile,
}

/// Result of running a processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult {
    /// Outputs are produced and uploaded.
    Completed {
        /// Media duration in seconds, if the processor measured it.
        duration_secs: Option<f64>,
    },
    /// Processing failed and may succeed on redelivery.
    Failed {
        /// Error detail forwarded to the status sink.
        reason: String,
    },
    /// The input will never be processable; redelivery cannot help.
    Rejected {
        /// Rejection category.
        kind: RejectionKind,
        /// Detail forwarded to the status sink.
        reason: String,
    },
}

impl ProcessingResult {
    /// Success without a measured duration.
    #[must_use]
    pub const fn completed() -> Self {
        Self::Completed {
            duration_secs: None,
        }
    }

    /// Retryable failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Permanent rejection.
    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            reason: reason.into(),
        }
    }
}

/// Performs the actual media transformation for one or more purposes.
///
/// A processor owns everything past the downloaded input: encoding, output
/// upload, and any cleanup of remote state. It is given the thread budget
/// the scheduler granted in [`ProcessingJob::threads`].
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether this processor handles `purpose`.
    fn supports(&self, purpose: UploadPurpose) -> bool;

    /// Process `input` and write intermediate files under `output_dir`.
    ///
    /// # Arguments
    ///
    /// * `job` - Object, probe result and thread budget
    /// * `input` - Downloaded source file inside the task's working directory
    /// * `output_dir` - Empty directory for outputs, removed after the call
    ///
    /// # Errors
    ///
    /// An `Err` is handled like [`ProcessingResult::Failed`].
    async fn process(
        &self,
        job: &ProcessingJob,
        input: &Path,
        output_dir: &Path,
    ) -> AppResult<ProcessingResult>;
}

/// Ordered set of processors; the first one supporting a purpose wins.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn MediaProcessor>>,
}

impl ProcessorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn MediaProcessor>) -> Self {
        self.register(processor);
        self
    }

    /// Append a processor.
    pub fn register(&mut self, processor: Arc<dyn MediaProcessor>) {
        self.processors.push(processor);
    }

    /// Processor for `purpose`, if any.
    #[must_use]
    pub fn processor_for(&self, purpose: UploadPurpose) -> Option<Arc<dyn MediaProcessor>> {
        self.processors
            .iter()
            .find(|p| p.supports(purpose))
            .map(Arc::clone)
    }

    /// Number of registered processors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether no processor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|p| p.name().to_owned()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static [UploadPurpose]);

    #[async_trait]
    impl MediaProcessor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn supports(&self, purpose: UploadPurpose) -> bool {
            self.1.contains(&purpose)
        }

        async fn process(
            &self,
            _job: &ProcessingJob,
            _input: &Path,
            _output_dir: &Path,
        ) -> AppResult<ProcessingResult> {
            Ok(ProcessingResult::completed())
        }
    }

    #[test]
    fn first_supporting_processor_wins() {
        let registry = ProcessorRegistry::new()
            .with_processor(Arc::new(Named("video", &[UploadPurpose::MovieSource])))
            .with_processor(Arc::new(Named(
                "any",
                &[UploadPurpose::MovieSource, UploadPurpose::UserAvatar],
            )));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.processor_for(UploadPurpose::MovieSource).unwrap().name(),
            "video"
        );
        assert_eq!(
            registry.processor_for(UploadPurpose::UserAvatar).unwrap().name(),
            "any"
        );
        assert!(registry.processor_for(UploadPurpose::MoviePoster).is_none());
    }
}
