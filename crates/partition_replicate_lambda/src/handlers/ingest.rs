use serde::Serialize;
use serde_json::Value;

use crate::adapters::queue::WorkQueue;
use crate::runtime::contract::{parse_change_notification, ParsedNotification, WorkItem};
use crate::runtime::error::ReplicationError;
use crate::runtime::filter::{EventFilter, SkipReason};

const COMPONENT: &str = "replication_ingest";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Queued {
        message_id: String,
        group_key: String,
        dedup_token: String,
    },
    Skipped {
        reason: String,
    },
}

impl IngestOutcome {
    fn skipped(reason: &SkipReason) -> Self {
        Self::Skipped {
            reason: reason.to_string(),
        }
    }
}

/// Turns one source bucket notification into at most one queued work item.
///
/// Notifications that can never be replicated are acknowledged as skipped.
/// Only a failed enqueue is returned as an error, so the invoking layer
/// redelivers the notification.
pub fn handle_ingest_event(
    event: &Value,
    filter: &EventFilter,
    queue: &dyn WorkQueue,
) -> Result<IngestOutcome, ReplicationError> {
    let parsed = match parse_change_notification(event) {
        Ok(value) => value,
        Err(error) => {
            tracing::error!(
                component = COMPONENT,
                event = "malformed_payload_dropped",
                error_code = error.error_code(),
                error = %error,
            );
            return Ok(IngestOutcome::Skipped {
                reason: error.to_string(),
            });
        }
    };

    let change = match parsed {
        ParsedNotification::Replicable(change) => change,
        ParsedNotification::Unsupported { detail_type } => {
            let reason = SkipReason::UnsupportedEventKind { detail_type };
            tracing::info!(
                component = COMPONENT,
                event = "notification_skipped",
                reason = %reason,
            );
            return Ok(IngestOutcome::skipped(&reason));
        }
    };

    if let Err(reason) = filter.evaluate(&change) {
        tracing::info!(
            component = COMPONENT,
            event = "notification_skipped",
            key = %change.key,
            kind = change.kind.as_str(),
            reason = %reason,
        );
        return Ok(IngestOutcome::skipped(&reason));
    }

    let item = WorkItem::from_event(change)?;
    let message_id = queue.enqueue(&item).map_err(|error| {
        tracing::warn!(
            component = COMPONENT,
            event = "enqueue_failed",
            key = %item.event.key,
            error_code = error.error_code(),
            error = %error,
        );
        error
    })?;

    tracing::info!(
        component = COMPONENT,
        event = "work_item_queued",
        key = %item.event.key,
        version_id = item.event.version_key(),
        kind = item.event.kind.as_str(),
        message_id = %message_id,
    );

    Ok(IngestOutcome::Queued {
        message_id,
        group_key: item.group_key,
        dedup_token: item.dedup_token,
    })
}
