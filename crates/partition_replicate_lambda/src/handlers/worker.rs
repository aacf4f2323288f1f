use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::adapters::credentials::CredentialProvider;
use crate::adapters::object_store::{
    destination_version, DestinationConnector, DestinationObjects, SourceObjects,
};
use crate::adapters::version_store::{
    format_timestamp, ClaimOutcome, ClaimRequest, DestinationMapping, SettleOutcome, VersionStore,
};
use crate::runtime::contract::{
    decode_queue_records, BatchResponse, EventKind, ObjectChangeEvent, WorkItem,
    DELETE_MARKER_CREATED, NULL_VERSION_ID, PERMANENTLY_DELETED,
};
use crate::runtime::error::ReplicationError;
use crate::runtime::version::{
    decide_claim, resolve_key, version_position, ClaimDecision, KeyResolution, VersionRecord,
};

const COMPONENT: &str = "replication_worker";

/// Per-invocation inputs that are not adapters.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub now: DateTime<Utc>,
    pub processing_lease: Duration,
}

#[derive(Clone, Copy)]
pub struct WorkerDependencies<'a> {
    pub version_store: &'a dyn VersionStore,
    pub source: &'a dyn SourceObjects,
    pub credentials: &'a dyn CredentialProvider,
    pub destination: &'a dyn DestinationConnector,
}

/// How one queue message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    Applied(EventKind),
    AlreadyCompleted,
    Stale { superseded_by: String },
    /// Acknowledged without effect; the message can never succeed.
    Dropped,
    /// Reported in `batchItemFailures` so the queue redelivers it.
    Retry(ReplicationError),
}

impl ItemDisposition {
    pub fn needs_redelivery(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Destination client shared by every item of one invocation.
///
/// The credential is read on first use only; a failed read is remembered so
/// later items fail fast instead of hammering the secret store.
struct DestinationSession<'a> {
    credentials: &'a dyn CredentialProvider,
    connector: &'a dyn DestinationConnector,
    state: Option<Result<Box<dyn DestinationObjects>, ReplicationError>>,
}

impl<'a> DestinationSession<'a> {
    fn new(credentials: &'a dyn CredentialProvider, connector: &'a dyn DestinationConnector) -> Self {
        Self {
            credentials,
            connector,
            state: None,
        }
    }

    fn objects(&mut self) -> Result<&dyn DestinationObjects, ReplicationError> {
        let credentials = self.credentials;
        let connector = self.connector;
        let state = self.state.get_or_insert_with(|| {
            credentials
                .destination_credential()
                .and_then(|credential| connector.connect(&credential))
        });

        match state {
            Ok(objects) => Ok(&**objects),
            Err(error) => Err(error.clone()),
        }
    }
}

/// Processes one queue batch and reports the messages to redeliver.
///
/// Items are independent: a failure of one never changes the disposition of
/// another. Only an event without a `Records` array fails the invocation.
pub fn handle_batch(
    event: &Value,
    context: &WorkerContext,
    dependencies: &WorkerDependencies<'_>,
) -> Result<BatchResponse, ReplicationError> {
    let records = decode_queue_records(event)?;
    let mut session = DestinationSession::new(dependencies.credentials, dependencies.destination);
    let mut response = BatchResponse::default();

    for record in records {
        let Some(message_id) = record.message_id.as_deref() else {
            tracing::error!(
                component = COMPONENT,
                event = "malformed_payload_dropped",
                detail = "queue record has no messageId",
            );
            continue;
        };

        let item = match record.decode_work_item() {
            Ok(item) => item,
            Err(error) => {
                tracing::error!(
                    component = COMPONENT,
                    event = "malformed_payload_dropped",
                    message_id,
                    error = %error,
                );
                continue;
            }
        };

        let disposition = process_item(message_id, &item, context, dependencies, &mut session);
        log_disposition(message_id, &item.event, &disposition);
        if disposition.needs_redelivery() {
            response.push_failure(message_id);
        }
    }

    Ok(response)
}

fn process_item(
    message_id: &str,
    item: &WorkItem,
    context: &WorkerContext,
    dependencies: &WorkerDependencies<'_>,
    session: &mut DestinationSession<'_>,
) -> ItemDisposition {
    match replicate(message_id, &item.event, context, dependencies, session) {
        Ok(disposition) => disposition,
        Err(error) if error.is_retryable() => ItemDisposition::Retry(error),
        Err(error) => {
            tracing::error!(
                component = COMPONENT,
                event = "item_dropped",
                message_id,
                key = %item.event.key,
                error_code = error.error_code(),
                error = %error,
            );
            ItemDisposition::Dropped
        }
    }
}

fn replicate(
    message_id: &str,
    event: &ObjectChangeEvent,
    context: &WorkerContext,
    dependencies: &WorkerDependencies<'_>,
    session: &mut DestinationSession<'_>,
) -> Result<ItemDisposition, ReplicationError> {
    let store = dependencies.version_store;
    let now = context.now;
    let version_id = event.version_key();
    let order_token = event.order_token();

    let history = store.history(&event.key)?;
    let existing = history.iter().find(|record| record.version_id == version_id);
    if decide_claim(existing, &order_token, now) == ClaimDecision::AlreadyCompleted {
        return Ok(ItemDisposition::AlreadyCompleted);
    }
    let position = version_position(&history, event);
    match resolve_key(&history, version_id, &position, now) {
        KeyResolution::Proceed => {}
        KeyResolution::Stale { superseded_by } => {
            return Ok(ItemDisposition::Stale { superseded_by });
        }
        KeyResolution::NewerInFlight { version_id } => {
            return Err(ReplicationError::UnresolvedVersionConflict {
                key: event.key.clone(),
                in_flight_version: version_id,
            });
        }
    }

    let claim_id = format!("{message_id}@{}", format_timestamp(now));
    let request = ClaimRequest {
        key: &event.key,
        version_id,
        order_token: &order_token,
        version_order: event.creates_version().then_some(&order_token),
        claim_id: &claim_id,
        event_kind: event.kind,
        now,
        lease: context.processing_lease,
    };
    let record = match store.claim(&request)? {
        ClaimOutcome::Acquired(record) => record,
        ClaimOutcome::AlreadyCompleted(_) => return Ok(ItemDisposition::AlreadyCompleted),
        ClaimOutcome::InFlight(record) => {
            return Err(ReplicationError::UnresolvedVersionConflict {
                key: event.key.clone(),
                in_flight_version: record.version_id,
            });
        }
    };

    // A newer version may have been claimed or completed since the first read.
    let history = store.history(&event.key)?;
    match resolve_key(&history, version_id, &position, now) {
        KeyResolution::Proceed => {}
        KeyResolution::Stale { superseded_by } => {
            settle("complete", &record, store.complete(&record, &DestinationMapping::Unchanged, now)?);
            return Ok(ItemDisposition::Stale { superseded_by });
        }
        KeyResolution::NewerInFlight { version_id } => {
            let conflict = ReplicationError::UnresolvedVersionConflict {
                key: event.key.clone(),
                in_flight_version: version_id,
            };
            release(store, &record, &conflict, now);
            return Err(conflict);
        }
    }

    match apply_change(event, &record, &history, dependencies, session) {
        Ok(mapping) => {
            settle("complete", &record, store.complete(&record, &mapping, now)?);
            Ok(ItemDisposition::Applied(event.kind))
        }
        Err(error) => {
            release(store, &record, &error, now);
            Err(error)
        }
    }
}

/// Marks the claimed row Failed so the next delivery can take it over.
fn release(store: &dyn VersionStore, record: &VersionRecord, error: &ReplicationError, now: DateTime<Utc>) {
    match store.fail(record, error, now) {
        Ok(outcome) => settle("fail", record, outcome),
        Err(fail_error) => tracing::warn!(
            component = COMPONENT,
            event = "record_failure_not_saved",
            key = %record.key,
            version_id = %record.version_id,
            error = %fail_error,
        ),
    }
}

fn settle(operation: &str, record: &VersionRecord, outcome: SettleOutcome) {
    if outcome == SettleOutcome::ClaimLost {
        tracing::warn!(
            component = COMPONENT,
            event = "claim_lost",
            operation,
            key = %record.key,
            version_id = %record.version_id,
            claim = %record.claim,
        );
    }
}

fn apply_change(
    event: &ObjectChangeEvent,
    record: &VersionRecord,
    history: &[VersionRecord],
    dependencies: &WorkerDependencies<'_>,
    session: &mut DestinationSession<'_>,
) -> Result<DestinationMapping, ReplicationError> {
    match event.kind {
        EventKind::Created => copy_object(event, dependencies.source, session),
        EventKind::TagsAdded | EventKind::TagsDeleted => {
            sync_tags(event, record, history, dependencies.source, session)
        }
        EventKind::Deleted => delete_object(event, record, history, session),
    }
}

fn copy_object(
    event: &ObjectChangeEvent,
    source: &dyn SourceObjects,
    session: &mut DestinationSession<'_>,
) -> Result<DestinationMapping, ReplicationError> {
    let version_id = event.version_id.as_deref();
    let fetched = source
        .fetch_object(&event.bucket, &event.key, version_id)
        .and_then(|object| {
            let tags = source.fetch_tags(&event.bucket, &event.key, version_id)?;
            Ok((object, tags))
        });

    let (object, tags) = match fetched {
        Ok(value) => value,
        // Deleted before it could be copied; the deletion event follows.
        Err(ReplicationError::SourceObjectMissing { .. }) => {
            tracing::info!(
                component = COMPONENT,
                event = "source_version_vanished",
                key = %event.key,
                version_id = event.version_key(),
            );
            return Ok(DestinationMapping::Unchanged);
        }
        Err(error) => return Err(error),
    };

    let destination_version_id = session.objects()?.put_object(&event.key, object, &tags)?;
    Ok(DestinationMapping::Set(
        destination_version_id.unwrap_or_else(|| NULL_VERSION_ID.to_string()),
    ))
}

fn sync_tags(
    event: &ObjectChangeEvent,
    record: &VersionRecord,
    history: &[VersionRecord],
    source: &dyn SourceObjects,
    session: &mut DestinationSession<'_>,
) -> Result<DestinationMapping, ReplicationError> {
    let tags = match source.fetch_tags(&event.bucket, &event.key, event.version_id.as_deref()) {
        Ok(tags) => tags,
        Err(ReplicationError::SourceObjectMissing { .. }) => {
            tracing::info!(
                component = COMPONENT,
                event = "source_version_vanished",
                key = %event.key,
                version_id = event.version_key(),
            );
            return Ok(DestinationMapping::Unchanged);
        }
        Err(error) => return Err(error),
    };

    let Some(stored) = record.destination_version_id.as_deref() else {
        if other_replica_exists(history, record) {
            // Copying an unreplicated older version would overwrite the
            // newer content on the destination.
            tracing::info!(
                component = COMPONENT,
                event = "tag_change_without_replica",
                key = %event.key,
                version_id = %record.version_id,
            );
            return Ok(DestinationMapping::Unchanged);
        }
        return copy_object(event, source, session);
    };

    let target = destination_version(stored);
    let objects = session.objects()?;
    let result = if tags.is_empty() {
        objects.delete_tags(&event.key, target)
    } else {
        objects.put_tags(&event.key, target, &tags)
    };

    match result {
        Ok(()) => Ok(DestinationMapping::Unchanged),
        Err(ReplicationError::DestinationObjectMissing { .. }) if tags.is_empty() => {
            Ok(DestinationMapping::Unchanged)
        }
        Err(ReplicationError::DestinationObjectMissing { .. }) => {
            tracing::info!(
                component = COMPONENT,
                event = "replica_missing_recopy",
                key = %event.key,
                version_id = %record.version_id,
            );
            copy_object(event, source, session)
        }
        Err(error) => Err(error),
    }
}

fn delete_object(
    event: &ObjectChangeEvent,
    record: &VersionRecord,
    history: &[VersionRecord],
    session: &mut DestinationSession<'_>,
) -> Result<DestinationMapping, ReplicationError> {
    let deletion_type = event.deletion_type.as_deref();
    let permanent = deletion_type == Some(PERMANENTLY_DELETED);

    let target = match record.destination_version_id.as_deref() {
        Some(stored) if deletion_type != Some(DELETE_MARKER_CREATED) => {
            let target = destination_version(stored);
            // On an unversioned destination the key holds whichever
            // version was copied last.
            if target.is_none() && permanent && other_replica_exists(history, record) {
                return Ok(DestinationMapping::Cleared);
            }
            target
        }
        None if permanent => {
            tracing::info!(
                component = COMPONENT,
                event = "unreplicated_version_deleted",
                key = %event.key,
                version_id = %record.version_id,
            );
            return Ok(DestinationMapping::Unchanged);
        }
        _ => None,
    };

    match session.objects()?.delete_object(&event.key, target) {
        Ok(()) | Err(ReplicationError::DestinationObjectMissing { .. }) => {
            Ok(DestinationMapping::Cleared)
        }
        Err(error) => Err(error),
    }
}

fn other_replica_exists(history: &[VersionRecord], record: &VersionRecord) -> bool {
    history.iter().any(|other| {
        other.version_id != record.version_id && other.destination_version_id.is_some()
    })
}

fn log_disposition(message_id: &str, event: &ObjectChangeEvent, disposition: &ItemDisposition) {
    let key = event.key.as_str();
    let version_id = event.version_key();
    let kind = event.kind.as_str();

    match disposition {
        ItemDisposition::Applied(_) => tracing::info!(
            component = COMPONENT,
            event = "item_replicated",
            message_id,
            key,
            version_id,
            kind,
        ),
        ItemDisposition::AlreadyCompleted => tracing::info!(
            component = COMPONENT,
            event = "item_already_completed",
            message_id,
            key,
            version_id,
            kind,
        ),
        ItemDisposition::Stale { superseded_by } => tracing::info!(
            component = COMPONENT,
            event = "item_superseded",
            message_id,
            key,
            version_id,
            kind,
            superseded_by = %superseded_by,
        ),
        ItemDisposition::Dropped => {}
        ItemDisposition::Retry(error @ ReplicationError::PermissionDenied { .. }) => tracing::error!(
            component = COMPONENT,
            event = "item_retry",
            message_id,
            key,
            version_id,
            kind,
            error_code = error.error_code(),
            error = %error,
        ),
        ItemDisposition::Retry(error) => tracing::warn!(
            component = COMPONENT,
            event = "item_retry",
            message_id,
            key,
            version_id,
            kind,
            error_code = error.error_code(),
            error = %error,
        ),
    }
}
