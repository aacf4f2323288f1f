//! In-memory adapters and event builders shared by unit and integration tests.
//!
//! Every fake keeps its state behind a `Mutex` so one instance can be shared
//! by concurrent workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};

use crate::adapters::credentials::{CredentialProvider, DestinationCredential};
use crate::adapters::object_store::{
    DestinationConnector, DestinationObjects, ObjectBody, ObjectMetadata, ObjectTags, SourceObject,
    SourceObjects,
};
use crate::adapters::queue::WorkQueue;
use crate::adapters::version_store::{
    ClaimOutcome, ClaimRequest, DestinationMapping, SettleOutcome, VersionStore,
};
use crate::handlers::worker::WorkerContext;
use crate::runtime::contract::{EventKind, ObjectChangeEvent, WorkItem, NULL_VERSION_ID};
use crate::runtime::error::ReplicationError;
use crate::runtime::ordering::OrderToken;
use crate::runtime::version::{decide_claim, ClaimDecision, VersionRecord, VersionStatus};

pub const SOURCE_BUCKET: &str = "source-data";
pub const TEST_LEASE_SECONDS: i64 = 900;

/// Fixed test clock: `at(0)` is 2026-02-14T10:00:00Z.
pub fn at(offset_seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0)
        .single()
        .expect("base test time should be valid")
        + Duration::seconds(offset_seconds)
}

pub fn worker_context(now: DateTime<Utc>) -> WorkerContext {
    WorkerContext {
        now,
        processing_lease: Duration::seconds(TEST_LEASE_SECONDS),
    }
}

/// EventBridge notification for `kind`, stamped `at(0)`.
pub fn notification(kind: EventKind, bucket: &str, key: &str, version_id: Option<&str>) -> Value {
    notification_at(kind, bucket, key, version_id, at(0))
}

pub fn notification_at(
    kind: EventKind,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    time: DateTime<Utc>,
) -> Value {
    let mut object = json!({
        "key": key,
        "size": 5,
        "sequencer": "0062E99A88DC407460",
    });
    if let Some(version_id) = version_id {
        object["version-id"] = json!(version_id);
    }

    let mut detail = json!({
        "version": "0",
        "bucket": {"name": bucket},
        "object": object,
        "request-id": "N4N7GDK58NMKJ12R",
        "requester": "123456789012",
    });
    if kind == EventKind::Deleted {
        detail["reason"] = json!("DeleteObject");
        detail["deletion-type"] = json!(if version_id.is_some() {
            "Delete Marker Created"
        } else {
            "Permanently Deleted"
        });
    }

    json!({
        "version": "0",
        "id": "17793124-05d4-b198-2fde-7ededc63b103",
        "detail-type": kind.detail_type(),
        "source": "aws.s3",
        "account": "123456789012",
        "time": time.to_rfc3339_opts(SecondsFormat::Secs, true),
        "region": "us-east-1",
        "resources": [format!("arn:aws:s3:::{bucket}")],
        "detail": detail,
    })
}

pub fn change_event(
    kind: EventKind,
    key: &str,
    version_id: Option<&str>,
    event_time: DateTime<Utc>,
) -> ObjectChangeEvent {
    ObjectChangeEvent {
        bucket: SOURCE_BUCKET.to_string(),
        key: key.to_string(),
        version_id: version_id.map(str::to_string),
        kind,
        event_time,
        sequencer: None,
        reason: (kind == EventKind::Deleted).then(|| "DeleteObject".to_string()),
        deletion_type: None,
    }
}

pub fn queue_record(message_id: &str, item: &WorkItem) -> Value {
    json!({
        "messageId": message_id,
        "receiptHandle": format!("handle-{message_id}"),
        "body": serde_json::to_string(item).expect("work item should serialize"),
        "attributes": {
            "MessageGroupId": item.group_key,
            "MessageDeduplicationId": item.dedup_token,
        },
        "eventSource": "aws:sqs",
    })
}

/// Queue record carrying `event` under `message_id`.
pub fn queued(message_id: &str, event: ObjectChangeEvent) -> Value {
    let item = WorkItem::from_event(event).expect("work item should build");
    queue_record(message_id, &item)
}

pub fn batch_event(records: Vec<Value>) -> Value {
    json!({ "Records": records })
}

pub struct RecordingQueue {
    items: Mutex<Vec<WorkItem>>,
    failure: Option<ReplicationError>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    pub fn failing(error: ReplicationError) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.items.lock().expect("poisoned mutex").clone()
    }

    /// Everything enqueued so far as one batch, with message ids `msg-1..`.
    pub fn batch_event(&self) -> Value {
        let records = self
            .items()
            .iter()
            .enumerate()
            .map(|(index, item)| queue_record(&format!("msg-{}", index + 1), item))
            .collect();
        batch_event(records)
    }
}

impl Default for RecordingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for RecordingQueue {
    fn enqueue(&self, item: &WorkItem) -> Result<String, ReplicationError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let mut items = self.items.lock().expect("poisoned mutex");
        items.push(item.clone());
        Ok(format!("msg-{}", items.len()))
    }
}

#[derive(Default)]
pub struct InMemoryVersionStore {
    rows: Mutex<HashMap<(String, String), VersionRecord>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, record: VersionRecord) {
        self.rows
            .lock()
            .expect("poisoned mutex")
            .insert((record.key.clone(), record.version_id.clone()), record);
    }

    /// A row claimed by another delivery.
    pub fn seed_processing(
        &self,
        key: &str,
        version_id: &str,
        event_time: DateTime<Utc>,
        claim: &str,
        lease_expires_at: DateTime<Utc>,
    ) {
        self.seed(VersionRecord {
            key: key.to_string(),
            version_id: version_id.to_string(),
            status: VersionStatus::Processing,
            attempts: 1,
            updated_at: event_time,
            order_token: OrderToken::new(event_time, None),
            version_order: Some(OrderToken::new(event_time, None)),
            claim: claim.to_string(),
            event_kind: EventKind::Created,
            lease_expires_at,
            destination_version_id: None,
            last_error: None,
        });
    }

    pub fn record(&self, key: &str, version_id: &str) -> Option<VersionRecord> {
        self.rows
            .lock()
            .expect("poisoned mutex")
            .get(&(key.to_string(), version_id.to_string()))
            .cloned()
    }

    fn settle(
        &self,
        record: &VersionRecord,
        apply: impl FnOnce(&mut VersionRecord),
    ) -> Result<SettleOutcome, ReplicationError> {
        let mut rows = self.rows.lock().expect("poisoned mutex");
        let Some(row) = rows.get_mut(&(record.key.clone(), record.version_id.clone())) else {
            return Ok(SettleOutcome::ClaimLost);
        };
        if row.claim != record.claim || row.status != VersionStatus::Processing {
            return Ok(SettleOutcome::ClaimLost);
        }
        apply(row);
        Ok(SettleOutcome::Settled)
    }
}

impl VersionStore for InMemoryVersionStore {
    fn history(&self, key: &str) -> Result<Vec<VersionRecord>, ReplicationError> {
        Ok(self
            .rows
            .lock()
            .expect("poisoned mutex")
            .values()
            .filter(|record| record.key == key)
            .cloned()
            .collect())
    }

    fn claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, ReplicationError> {
        let mut rows = self.rows.lock().expect("poisoned mutex");
        let id = (request.key.to_string(), request.version_id.to_string());
        let existing = rows.get(&id);

        match decide_claim(existing, request.order_token, request.now) {
            ClaimDecision::Acquire => {
                let record = request.claimed_record(existing);
                rows.insert(id, record.clone());
                Ok(ClaimOutcome::Acquired(record))
            }
            ClaimDecision::AlreadyCompleted => Ok(ClaimOutcome::AlreadyCompleted(
                existing.cloned().expect("completed row exists"),
            )),
            ClaimDecision::InFlight => Ok(ClaimOutcome::InFlight(
                existing.cloned().expect("in-flight row exists"),
            )),
        }
    }

    fn complete(
        &self,
        record: &VersionRecord,
        mapping: &DestinationMapping,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError> {
        self.settle(record, |row| {
            row.status = VersionStatus::Completed;
            row.updated_at = now;
            row.last_error = None;
            match mapping {
                DestinationMapping::Unchanged => {}
                DestinationMapping::Set(version_id) => {
                    row.destination_version_id = Some(version_id.clone());
                }
                DestinationMapping::Cleared => row.destination_version_id = None,
            }
        })
    }

    fn fail(
        &self,
        record: &VersionRecord,
        error: &ReplicationError,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError> {
        self.settle(record, |row| {
            row.status = VersionStatus::Failed;
            row.updated_at = now;
            row.last_error = Some(format!("{}: {error}", error.error_code()));
        })
    }
}

#[derive(Debug, Clone)]
struct SourceVersion {
    body: Vec<u8>,
    metadata: ObjectMetadata,
    tags: ObjectTags,
}

/// Source bucket keyed by (bucket, key, version); unversioned objects live
/// under `$null`.
#[derive(Default)]
pub struct InMemorySource {
    objects: Mutex<HashMap<(String, String, String), SourceVersion>>,
}

fn source_id(bucket: &str, key: &str, version_id: Option<&str>) -> (String, String, String) {
    (
        bucket.to_string(),
        key.to_string(),
        version_id.unwrap_or(NULL_VERSION_ID).to_string(),
    )
}

fn tag_set(tags: &[(&str, &str)]) -> ObjectTags {
    tags.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        body: &[u8],
        tags: &[(&str, &str)],
    ) {
        self.objects.lock().expect("poisoned mutex").insert(
            source_id(bucket, key, version_id),
            SourceVersion {
                body: body.to_vec(),
                metadata: ObjectMetadata {
                    content_type: Some("text/plain".to_string()),
                    ..ObjectMetadata::default()
                },
                tags: tag_set(tags),
            },
        );
    }

    pub fn set_tags(&self, bucket: &str, key: &str, version_id: Option<&str>, tags: &[(&str, &str)]) {
        if let Some(object) = self
            .objects
            .lock()
            .expect("poisoned mutex")
            .get_mut(&source_id(bucket, key, version_id))
        {
            object.tags = tag_set(tags);
        }
    }

    pub fn remove(&self, bucket: &str, key: &str, version_id: Option<&str>) {
        self.objects
            .lock()
            .expect("poisoned mutex")
            .remove(&source_id(bucket, key, version_id));
    }

    fn lookup(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<SourceVersion, ReplicationError> {
        self.objects
            .lock()
            .expect("poisoned mutex")
            .get(&source_id(bucket, key, version_id))
            .cloned()
            .ok_or_else(|| ReplicationError::SourceObjectMissing {
                key: key.to_string(),
                version: version_id.unwrap_or(NULL_VERSION_ID).to_string(),
            })
    }
}

impl SourceObjects for InMemorySource {
    fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<SourceObject, ReplicationError> {
        let version = self.lookup(bucket, key, version_id)?;
        Ok(SourceObject {
            content_length: u64::try_from(version.body.len()).ok(),
            body: ObjectBody::Bytes(version.body),
            metadata: version.metadata,
        })
    }

    fn fetch_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectTags, ReplicationError> {
        Ok(self.lookup(bucket, key, version_id)?.tags)
    }
}

/// One version of a destination key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub version_id: String,
    pub body: Vec<u8>,
    pub metadata: ObjectMetadata,
    pub tags: ObjectTags,
    pub delete_marker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationCall {
    PutObject { key: String },
    PutTags { key: String, version_id: Option<String> },
    DeleteTags { key: String, version_id: Option<String> },
    DeleteObject { key: String, version_id: Option<String> },
}

#[derive(Default)]
struct DestinationState {
    versioned: bool,
    next_version: u64,
    objects: BTreeMap<String, Vec<StoredObject>>,
    calls: Vec<DestinationCall>,
    failures: HashMap<String, ReplicationError>,
    connects: usize,
}

impl DestinationState {
    fn find_version(&mut self, key: &str, version_id: Option<&str>) -> Option<&mut StoredObject> {
        let versions = self.objects.get_mut(key)?;
        match version_id {
            Some(version_id) => versions
                .iter_mut()
                .find(|object| object.version_id == version_id),
            None => versions.last_mut().filter(|object| !object.delete_marker),
        }
    }

    fn injected_failure(&self, key: &str) -> Result<(), ReplicationError> {
        match self.failures.get(key) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Destination bucket; `connect` hands out clients sharing one state.
#[derive(Clone)]
pub struct InMemoryDestination {
    state: Arc<Mutex<DestinationState>>,
    denied: Option<ReplicationError>,
}

impl InMemoryDestination {
    pub fn versioned() -> Self {
        Self::with_versioning(true)
    }

    pub fn unversioned() -> Self {
        Self::with_versioning(false)
    }

    fn with_versioning(versioned: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(DestinationState {
                versioned,
                ..DestinationState::default()
            })),
            denied: None,
        }
    }

    /// Rejects every `connect`, as a revoked destination credential would.
    pub fn denying(mut self, error: ReplicationError) -> Self {
        self.denied = Some(error);
        self
    }

    /// Every write to `key` fails with `error` until cleared.
    pub fn fail_key(&self, key: &str, error: ReplicationError) {
        self.lock().failures.insert(key.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Latest version of `key` unless it is a delete marker.
    pub fn current(&self, key: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(key)
            .and_then(|versions| versions.last())
            .filter(|object| !object.delete_marker)
            .cloned()
    }

    pub fn versions(&self, key: &str) -> Vec<StoredObject> {
        self.lock().objects.get(key).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<DestinationCall> {
        self.lock().calls.clone()
    }

    pub fn put_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, DestinationCall::PutObject { .. }))
            .count()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DestinationState> {
        self.state.lock().expect("poisoned mutex")
    }
}

impl DestinationConnector for InMemoryDestination {
    fn connect(
        &self,
        _credential: &DestinationCredential,
    ) -> Result<Box<dyn DestinationObjects>, ReplicationError> {
        if let Some(error) = &self.denied {
            return Err(error.clone());
        }
        self.lock().connects += 1;
        Ok(Box::new(InMemoryDestinationObjects {
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryDestinationObjects {
    state: Arc<Mutex<DestinationState>>,
}

impl DestinationObjects for InMemoryDestinationObjects {
    fn put_object(
        &self,
        key: &str,
        object: SourceObject,
        tags: &ObjectTags,
    ) -> Result<Option<String>, ReplicationError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        state.calls.push(DestinationCall::PutObject {
            key: key.to_string(),
        });
        state.injected_failure(key)?;

        let version_id = if state.versioned {
            state.next_version += 1;
            Some(format!("d{}", state.next_version))
        } else {
            None
        };
        let stored = StoredObject {
            version_id: version_id.clone().unwrap_or_else(|| NULL_VERSION_ID.to_string()),
            body: object.body.into_bytes()?,
            metadata: object.metadata,
            tags: tags.clone(),
            delete_marker: false,
        };

        let versioned = state.versioned;
        let versions = state.objects.entry(key.to_string()).or_default();
        if !versioned {
            versions.clear();
        }
        versions.push(stored);
        Ok(version_id)
    }

    fn put_tags(
        &self,
        key: &str,
        version_id: Option<&str>,
        tags: &ObjectTags,
    ) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        state.calls.push(DestinationCall::PutTags {
            key: key.to_string(),
            version_id: version_id.map(str::to_string),
        });
        state.injected_failure(key)?;

        let object = state
            .find_version(key, version_id)
            .ok_or_else(|| ReplicationError::DestinationObjectMissing {
                key: key.to_string(),
            })?;
        object.tags = tags.clone();
        Ok(())
    }

    fn delete_tags(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        state.calls.push(DestinationCall::DeleteTags {
            key: key.to_string(),
            version_id: version_id.map(str::to_string),
        });
        state.injected_failure(key)?;

        let object = state
            .find_version(key, version_id)
            .ok_or_else(|| ReplicationError::DestinationObjectMissing {
                key: key.to_string(),
            })?;
        object.tags.clear();
        Ok(())
    }

    fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().expect("poisoned mutex");
        state.calls.push(DestinationCall::DeleteObject {
            key: key.to_string(),
            version_id: version_id.map(str::to_string),
        });
        state.injected_failure(key)?;

        match (version_id, state.versioned) {
            (Some(version_id), _) => {
                if let Some(versions) = state.objects.get_mut(key) {
                    versions.retain(|object| object.version_id != version_id);
                    if versions.is_empty() {
                        state.objects.remove(key);
                    }
                }
            }
            (None, true) => {
                state.next_version += 1;
                let marker = StoredObject {
                    version_id: format!("d{}", state.next_version),
                    body: Vec::new(),
                    metadata: ObjectMetadata::default(),
                    tags: ObjectTags::new(),
                    delete_marker: true,
                };
                state.objects.entry(key.to_string()).or_default().push(marker);
            }
            (None, false) => {
                if state.objects.remove(key).is_none() {
                    return Err(ReplicationError::DestinationObjectMissing {
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct StaticCredentials {
    credential: Result<DestinationCredential, ReplicationError>,
    fetches: Mutex<usize>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self {
            credential: Ok(DestinationCredential {
                access_id: "AKIDEXAMPLE".to_string(),
                access_secret: "wJalrXUtnFEMI".to_string(),
                partition: "aws-cn".to_string(),
            }),
            fetches: Mutex::new(0),
        }
    }

    pub fn failing(error: ReplicationError) -> Self {
        Self {
            credential: Err(error),
            fetches: Mutex::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().expect("poisoned mutex")
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for StaticCredentials {
    fn destination_credential(&self) -> Result<DestinationCredential, ReplicationError> {
        *self.fetches.lock().expect("poisoned mutex") += 1;
        self.credential.clone()
    }
}
