use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ReplicationError;
use crate::ordering::OrderToken;

/// Sort key used for objects of unversioned buckets.
pub const NULL_VERSION_ID: &str = "$null";
/// The only `Object Deleted` reason that is replicated; lifecycle
/// expirations are expected to be configured on the destination directly.
pub const DELETE_OBJECT_REASON: &str = "DeleteObject";
pub const DELETE_MARKER_CREATED: &str = "Delete Marker Created";
pub const PERMANENTLY_DELETED: &str = "Permanently Deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Object Created")]
    Created,
    #[serde(rename = "Object Deleted")]
    Deleted,
    #[serde(rename = "Object Tags Added")]
    TagsAdded,
    #[serde(rename = "Object Tags Deleted")]
    TagsDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Deleted,
        EventKind::TagsAdded,
        EventKind::TagsDeleted,
    ];

    pub fn detail_type(self) -> &'static str {
        match self {
            Self::Created => "Object Created",
            Self::Deleted => "Object Deleted",
            Self::TagsAdded => "Object Tags Added",
            Self::TagsDeleted => "Object Tags Deleted",
        }
    }

    pub fn from_detail_type(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.detail_type() == value)
    }

    /// Short name used in logs and the version table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::TagsAdded => "tags_added",
            Self::TagsDeleted => "tags_deleted",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectChangeEvent {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub kind: EventKind,
    pub event_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_type: Option<String>,
}

impl ObjectChangeEvent {
    /// Sort key of this event's row in the version table.
    pub fn version_key(&self) -> &str {
        self.version_id.as_deref().unwrap_or(NULL_VERSION_ID)
    }

    pub fn order_token(&self) -> OrderToken {
        OrderToken::new(self.event_time, self.sequencer.as_deref())
    }

    /// Whether this event brings its version into existence, fixing the
    /// version's place among the other versions of the key. Tag changes and
    /// permanent deletions act on a version that already has a place.
    pub fn creates_version(&self) -> bool {
        match self.kind {
            EventKind::Created => true,
            EventKind::Deleted => self.deletion_type.as_deref() != Some(PERMANENTLY_DELETED),
            EventKind::TagsAdded | EventKind::TagsDeleted => false,
        }
    }
}

/// Result of reading a raw change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedNotification {
    Replicable(ObjectChangeEvent),
    /// Restores, storage-class changes, ACL updates and the like.
    Unsupported { detail_type: String },
}

#[derive(Deserialize)]
struct ChangeNotification {
    time: DateTime<Utc>,
    detail: NotificationDetail,
}

#[derive(Deserialize)]
struct NotificationDetail {
    bucket: NotificationBucket,
    object: NotificationObject,
    #[serde(default)]
    reason: Option<String>,
    #[serde(rename = "deletion-type", default)]
    deletion_type: Option<String>,
}

#[derive(Deserialize)]
struct NotificationBucket {
    name: String,
}

#[derive(Deserialize)]
struct NotificationObject {
    key: String,
    #[serde(rename = "version-id", default)]
    version_id: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

pub fn parse_change_notification(event: &Value) -> Result<ParsedNotification, ReplicationError> {
    let detail_type = event
        .get("detail-type")
        .and_then(Value::as_str)
        .ok_or_else(|| ReplicationError::malformed("notification must include detail-type"))?;

    let Some(kind) = EventKind::from_detail_type(detail_type) else {
        return Ok(ParsedNotification::Unsupported {
            detail_type: detail_type.to_string(),
        });
    };

    let notification: ChangeNotification = serde_json::from_value(event.clone())
        .map_err(|error| ReplicationError::malformed(format!("invalid notification: {error}")))?;

    if notification.detail.object.key.is_empty() {
        return Err(ReplicationError::malformed("object key cannot be empty"));
    }

    Ok(ParsedNotification::Replicable(ObjectChangeEvent {
        bucket: notification.detail.bucket.name,
        key: notification.detail.object.key,
        version_id: notification
            .detail
            .object
            .version_id
            .filter(|value| !value.is_empty()),
        kind,
        event_time: notification.time,
        sequencer: notification.detail.object.sequencer,
        reason: notification.detail.reason,
        deletion_type: notification.detail.deletion_type,
    }))
}

/// Queue-carried envelope around one change event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub event: ObjectChangeEvent,
    pub group_key: String,
    pub dedup_token: String,
}

impl WorkItem {
    pub fn from_event(event: ObjectChangeEvent) -> Result<Self, ReplicationError> {
        let dedup_token = dedup_token(&event)?;
        Ok(Self {
            group_key: event.key.clone(),
            dedup_token,
            event,
        })
    }
}

#[derive(Serialize)]
struct DedupIdentity<'a> {
    key: &'a str,
    version_id: Option<&'a str>,
    kind: EventKind,
    event_time: &'a DateTime<Utc>,
}

/// SHA-256 of the identity of an upstream notification. Redelivery of the
/// same notification yields the same token; any distinct change does not.
pub fn dedup_token(event: &ObjectChangeEvent) -> Result<String, ReplicationError> {
    let identity = DedupIdentity {
        key: &event.key,
        version_id: event.version_id.as_deref(),
        kind: event.kind,
        event_time: &event.event_time,
    };
    let json = serde_json::to_string(&identity)
        .map_err(|error| ReplicationError::malformed(format!("unhashable event: {error}")))?;

    let mut hasher = Sha256::new();
    hasher.update(json);
    Ok(format!("{:x}", hasher.finalize()))
}

/// One message of a queue batch, as much of it as could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub message_id: Option<String>,
    pub body: Option<String>,
}

impl QueueRecord {
    pub fn decode_work_item(&self) -> Result<WorkItem, ReplicationError> {
        let body = self
            .body
            .as_deref()
            .ok_or_else(|| ReplicationError::malformed("queue record body must be a string"))?;
        serde_json::from_str(body)
            .map_err(|error| ReplicationError::malformed(format!("invalid work item: {error}")))
    }
}

pub fn decode_queue_records(event: &Value) -> Result<Vec<QueueRecord>, ReplicationError> {
    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::malformed("queue event must include Records array"))?;

    Ok(records
        .iter()
        .map(|record| QueueRecord {
            message_id: record
                .get("messageId")
                .and_then(Value::as_str)
                .map(str::to_string),
            body: record.get("body").and_then(Value::as_str).map(str::to_string),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

/// Partial-batch acknowledgement: only listed messages are redelivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn push_failure(&mut self, message_id: impl Into<String>) {
        self.batch_item_failures.push(BatchItemFailure {
            item_identifier: message_id.into(),
        });
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.batch_item_failures
            .iter()
            .map(|failure| failure.item_identifier.as_str())
            .collect()
    }
}
