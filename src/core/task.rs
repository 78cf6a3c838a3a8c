//! Task records handed between pipeline stages.
//!
//! Each record owns its broker [`Delivery`] and is moved from stage to stage
//! through the queues, so exactly one stage holds a message at a time.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::cost::cost_for_height;
use crate::core::{Delivery, ResourceHandle};
use crate::util::clock::now_ms;

/// Why a file was uploaded. Selects probing and the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadPurpose {
    /// Full-length video source.
    MovieSource,
    /// Trailer video.
    MovieTrailer,
    /// Poster image.
    MoviePoster,
    /// User avatar image.
    UserAvatar,
}

impl UploadPurpose {
    /// Parse a metadata value such as `MOVIE_SOURCE` or `movie-source`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "MOVIE_SOURCE" => Some(Self::MovieSource),
            "MOVIE_TRAILER" => Some(Self::MovieTrailer),
            "MOVIE_POSTER" => Some(Self::MoviePoster),
            "USER_AVATAR" => Some(Self::UserAvatar),
            _ => None,
        }
    }

    /// Video purposes are probed; images get a fixed cost.
    #[must_use]
    pub const fn is_video(self) -> bool {
        matches!(self, Self::MovieSource | Self::MovieTrailer)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MovieSource => "MOVIE_SOURCE",
            Self::MovieTrailer => "MOVIE_TRAILER",
            Self::MoviePoster => "MOVIE_POSTER",
            Self::UserAvatar => "USER_AVATAR",
        }
    }
}

impl fmt::Display for UploadPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uploaded object a task refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaObject {
    /// Bucket name.
    pub bucket: String,
    /// Decoded object key.
    pub key: String,
    /// Declared purpose.
    pub purpose: UploadPurpose,
    /// Correlation id used for status events.
    pub upload_id: String,
    /// MIME type reported by the store.
    pub content_type: Option<String>,
    /// Size in bytes.
    pub size_bytes: u64,
}

impl MediaObject {
    /// `bucket/key`, used as the task id in logs and heartbeat keys.
    #[must_use]
    pub fn task_id(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// File extension of the key including the dot, or empty.
    #[must_use]
    pub fn extension(&self) -> String {
        Path::new(&self.key)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default()
    }
}

/// Outcome of probing: dimensions plus the peak cost the job will need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    /// Pixel width, 0 when not probed.
    pub width: u32,
    /// Pixel height, 0 when not probed.
    pub height: u32,
    /// Duration in seconds, if known.
    pub duration_secs: Option<f64>,
    /// Peak resource cost; always at least 1.
    pub peak_cost: u32,
}

impl ProbeResult {
    /// Result for a probed video, costed from its height.
    #[must_use]
    pub const fn from_dimensions(width: u32, height: u32, duration_secs: Option<f64>) -> Self {
        Self {
            width,
            height,
            duration_secs,
            peak_cost: cost_for_height(height),
        }
    }

    /// Result for an unprobed object with a fixed cost.
    #[must_use]
    pub const fn fixed(cost: u32) -> Self {
        Self {
            width: 0,
            height: 0,
            duration_secs: None,
            peak_cost: if cost == 0 { 1 } else { cost },
        }
    }
}

/// Work item waiting for cost discovery and admission.
#[derive(Debug)]
pub struct ProbeTask {
    /// Broker message this task answers to.
    pub delivery: Delivery,
    /// Object to process.
    pub object: MediaObject,
    /// When the task last entered the probe queue.
    pub enqueued_at_ms: u128,
    /// Admission attempts that timed out so far.
    pub attempts: u32,
    /// Probe result from an earlier attempt; reused on requeue.
    pub cached_probe: Option<ProbeResult>,
}

impl ProbeTask {
    /// Fresh task for a newly fetched message.
    #[must_use]
    pub fn new(delivery: Delivery, object: MediaObject) -> Self {
        Self {
            delivery,
            object,
            enqueued_at_ms: now_ms(),
            attempts: 0,
            cached_probe: None,
        }
    }

    /// The same task after a denied admission, ready to go to the tail of
    /// the probe queue. The delivery is carried over untouched.
    #[must_use]
    pub fn requeued(self, probe: ProbeResult) -> Self {
        Self {
            enqueued_at_ms: now_ms(),
            attempts: self.attempts + 1,
            cached_probe: Some(probe),
            ..self
        }
    }

    /// Promote to an execute task once capacity was granted.
    #[must_use]
    pub fn admit(self, probe: ProbeResult, resource: ResourceHandle) -> ExecuteTask {
        ExecuteTask {
            delivery: self.delivery,
            object: self.object,
            probe,
            resource,
            probed_at_ms: now_ms(),
        }
    }
}

/// Admitted work item holding its reserved capacity.
#[derive(Debug)]
pub struct ExecuteTask {
    /// Broker message this task answers to.
    pub delivery: Delivery,
    /// Object to process.
    pub object: MediaObject,
    /// Probe result that set the cost.
    pub probe: ProbeResult,
    /// Reserved capacity; released by the executor.
    pub resource: ResourceHandle,
    /// When admission succeeded.
    pub probed_at_ms: u128,
}

impl ExecuteTask {
    /// Split into the pieces the executor owns separately.
    #[must_use]
    pub fn into_parts(self) -> (Delivery, ResourceHandle, ProcessingJob) {
        let job = ProcessingJob {
            threads: self.resource.units(),
            object: self.object,
            probe: self.probe,
        };
        (self.delivery, self.resource, job)
    }
}

/// What a processor is given to work on.
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    /// Object being processed.
    pub object: MediaObject,
    /// Probe result.
    pub probe: ProbeResult,
    /// Thread budget granted by the scheduler.
    pub threads: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: &str) -> MediaObject {
        MediaObject {
            bucket: "uploads".into(),
            key: key.into(),
            purpose: UploadPurpose::MovieSource,
            upload_id: "u-1".into(),
            content_type: None,
            size_bytes: 0,
        }
    }

    #[test]
    fn purpose_parsing_is_lenient() {
        assert_eq!(UploadPurpose::parse("movie_source"), Some(UploadPurpose::MovieSource));
        assert_eq!(UploadPurpose::parse("Movie-Trailer"), Some(UploadPurpose::MovieTrailer));
        assert_eq!(UploadPurpose::parse(" USER_AVATAR "), Some(UploadPurpose::UserAvatar));
        assert_eq!(UploadPurpose::parse("banner"), None);
        assert!(UploadPurpose::MovieTrailer.is_video());
        assert!(!UploadPurpose::MoviePoster.is_video());
    }

    #[test]
    fn extension_keeps_the_dot() {
        assert_eq!(object("movies/a b/clip.MP4").extension(), ".MP4");
        assert_eq!(object("raw").extension(), "");
        assert_eq!(object("movies/clip.mp4").task_id(), "uploads/movies/clip.mp4");
    }

    #[test]
    fn fixed_probe_cost_is_never_zero() {
        assert_eq!(ProbeResult::fixed(0).peak_cost, 1);
        assert_eq!(ProbeResult::from_dimensions(1920, 1080, None).peak_cost, 32);
    }
}
