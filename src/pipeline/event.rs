//! Decoding of S3-style object-store notifications.
//!
//! Only the first record of a notification is looked at; MinIO sends one
//! event per message. User metadata keys arrive in several spellings
//! depending on the store version (`X-Amz-Meta-Upload-Id`,
//! `x-amz-meta-upload-id`, `upload-id`, `uploadId`, ...), so keys are
//! compared after folding case, dropping the `x-amz-meta-` prefix and
//! removing separators.

use std::collections::HashMap;

use serde::Deserialize;

use crate::core::EventError;

const CREATED_PREFIX: &str = "s3:ObjectCreated:";
const META_PREFIX: &str = "x-amz-meta-";

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Option<Vec<Record>>,
}

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(rename = "eventName", default)]
    event_name: String,
    #[serde(default)]
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    #[serde(default)]
    bucket: Option<BucketEntity>,
    #[serde(default)]
    object: Option<ObjectEntity>,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    #[serde(default)]
    key: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
    #[serde(rename = "userMetadata", default)]
    user_metadata: Option<HashMap<String, String>>,
}

/// Purpose and correlation id pulled from user metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Raw purpose value, not yet validated.
    pub purpose: Option<String>,
    /// Upload id, falling back to a video id.
    pub upload_id: Option<String>,
}

impl UploadMetadata {
    /// Extract from a metadata map with any of the known key spellings.
    ///
    /// When several spellings carry a value, `x-amz-meta-` prefixed keys win
    /// over bare ones, and ties go to the lexically smallest key.
    #[must_use]
    pub fn from_map(metadata: &HashMap<String, String>) -> Self {
        let mut entries: Vec<(bool, &str, &str)> = metadata
            .iter()
            .map(|(key, value)| (!is_prefixed(key), key.as_str(), value.trim()))
            .filter(|(_, _, value)| !value.is_empty())
            .collect();
        entries.sort_unstable();

        let lookup = |field: &str| {
            entries
                .iter()
                .find(|(_, key, _)| normalize_key(key) == field)
                .map(|(_, _, value)| (*value).to_owned())
        };
        Self {
            purpose: lookup("purpose"),
            upload_id: lookup("uploadid").or_else(|| lookup("videoid")),
        }
    }

    /// Fill missing fields from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            purpose: self.purpose.or(other.purpose),
            upload_id: self.upload_id.or(other.upload_id),
        }
    }

    /// Whether both fields are present.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.purpose.is_some() && self.upload_id.is_some()
    }
}

fn is_prefixed(key: &str) -> bool {
    key.trim().to_ascii_lowercase().starts_with(META_PREFIX)
}

fn normalize_key(key: &str) -> String {
    let lower = key.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix(META_PREFIX).unwrap_or(&lower);
    bare.chars().filter(|c| *c != '-' && *c != '_').collect()
}

/// An object-created event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    /// Full event name, e.g. `s3:ObjectCreated:Put`.
    pub event_name: String,
    /// Bucket name.
    pub bucket: String,
    /// Decoded object key.
    pub key: String,
    /// Size reported in the event, if any.
    pub size: Option<u64>,
    /// Content type reported in the event, if any.
    pub content_type: Option<String>,
    /// Metadata carried by the event.
    pub metadata: UploadMetadata,
}

/// Why a well-formed notification carries no work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// `Records` missing or empty.
    NoRecords,
    /// Not an object-created event.
    NotObjectCreated(String),
}

/// Decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// An object was created and should be processed.
    Created(ObjectCreated),
    /// Nothing to do.
    Skip(SkipReason),
}

/// Decode a raw notification payload.
///
/// # Errors
/// [`EventError`] if the payload is not JSON, lacks bucket or key, or the
/// key is not valid percent-encoding.
pub fn parse_notification(payload: &[u8]) -> Result<ParsedEvent, EventError> {
    let notification: Notification = serde_json::from_slice(payload)?;
    let Some(record) = notification.records.and_then(|r| r.into_iter().next()) else {
        return Ok(ParsedEvent::Skip(SkipReason::NoRecords));
    };
    if !record.event_name.starts_with(CREATED_PREFIX) {
        return Ok(ParsedEvent::Skip(SkipReason::NotObjectCreated(
            record.event_name,
        )));
    }

    let s3 = record.s3.ok_or(EventError::MissingField("s3"))?;
    let bucket = s3
        .bucket
        .map(|b| b.name)
        .filter(|name| !name.is_empty())
        .ok_or(EventError::MissingField("s3.bucket.name"))?;
    let object = s3.object.ok_or(EventError::MissingField("s3.object"))?;
    if object.key.is_empty() {
        return Err(EventError::MissingField("s3.object.key"));
    }
    let key = decode_key(&object.key)?;
    let metadata = object
        .user_metadata
        .as_ref()
        .map(UploadMetadata::from_map)
        .unwrap_or_default();

    Ok(ParsedEvent::Created(ObjectCreated {
        event_name: record.event_name,
        bucket,
        key,
        size: object.size,
        content_type: object.content_type,
        metadata,
    }))
}

/// Decode a form-encoded object key (`+` is a space).
///
/// # Errors
/// [`EventError::KeyEncoding`] for invalid UTF-8 after decoding.
pub fn decode_key(raw: &str) -> Result<String, EventError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| EventError::KeyEncoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created(key: &str, metadata: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "EventName": "s3:ObjectCreated:Put",
            "Records": [{
                "eventName": "s3:ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "uploads" },
                    "object": { "key": key, "size": 2048, "userMetadata": metadata }
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn decodes_key_and_metadata_variants() {
        let payload = created(
            "movies%2Fmy+clip%20v2.mp4",
            json!({ "X-Amz-Meta-Purpose": "MOVIE_SOURCE", "X-Amz-Meta-Upload-Id": "u-42" }),
        );
        let ParsedEvent::Created(event) = parse_notification(&payload).unwrap() else {
            panic!("expected created event");
        };
        assert_eq!(event.bucket, "uploads");
        assert_eq!(event.key, "movies/my clip v2.mp4");
        assert_eq!(event.size, Some(2048));
        assert_eq!(event.metadata.purpose.as_deref(), Some("MOVIE_SOURCE"));
        assert_eq!(event.metadata.upload_id.as_deref(), Some("u-42"));
    }

    #[test]
    fn video_id_is_a_fallback_for_upload_id() {
        let meta: HashMap<String, String> = [
            ("x-amz-meta-video-id".to_owned(), "v-1".to_owned()),
            ("purpose".to_owned(), "USER_AVATAR".to_owned()),
        ]
        .into();
        assert_eq!(UploadMetadata::from_map(&meta).upload_id.as_deref(), Some("v-1"));

        let meta: HashMap<String, String> = [
            ("videoId".to_owned(), "v-1".to_owned()),
            ("uploadId".to_owned(), "u-1".to_owned()),
        ]
        .into();
        let parsed = UploadMetadata::from_map(&meta);
        assert_eq!(parsed.upload_id.as_deref(), Some("u-1"));
        assert!(!parsed.is_complete());
    }

    #[test]
    fn prefixed_spelling_wins_over_bare_key() {
        let meta: HashMap<String, String> = [
            ("purpose".to_owned(), "USER_AVATAR".to_owned()),
            ("X-Amz-Meta-Purpose".to_owned(), "MOVIE_SOURCE".to_owned()),
            ("upload-id".to_owned(), "bare".to_owned()),
            ("x-amz-meta-upload-id".to_owned(), "prefixed".to_owned()),
            ("Purpose".to_owned(), " ".to_owned()),
        ]
        .into();
        for _ in 0..16 {
            let parsed = UploadMetadata::from_map(&meta.clone().into_iter().collect());
            assert_eq!(parsed.purpose.as_deref(), Some("MOVIE_SOURCE"));
            assert_eq!(parsed.upload_id.as_deref(), Some("prefixed"));
        }
    }

    #[test]
    fn non_creation_and_empty_events_are_skipped() {
        let removed = json!({ "Records": [{ "eventName": "s3:ObjectRemoved:Delete" }] });
        assert_eq!(
            parse_notification(&serde_json::to_vec(&removed).unwrap()).unwrap(),
            ParsedEvent::Skip(SkipReason::NotObjectCreated("s3:ObjectRemoved:Delete".into()))
        );
        assert_eq!(
            parse_notification(br#"{"Records": []}"#).unwrap(),
            ParsedEvent::Skip(SkipReason::NoRecords)
        );
        assert_eq!(
            parse_notification(br"{}").unwrap(),
            ParsedEvent::Skip(SkipReason::NoRecords)
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            parse_notification(b"not json"),
            Err(EventError::Malformed(_))
        ));
        let no_bucket = json!({ "Records": [{
            "eventName": "s3:ObjectCreated:Put",
            "s3": { "object": { "key": "a.mp4" } }
        }]});
        assert!(matches!(
            parse_notification(&serde_json::to_vec(&no_bucket).unwrap()),
            Err(EventError::MissingField("s3.bucket.name"))
        ));
    }
}
