use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{EventKind, ObjectChangeEvent};
use crate::ordering::OrderToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionStatus {
    Processing,
    Completed,
    Failed,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Processing" => Ok(Self::Processing),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown version status '{other}'")),
        }
    }
}

/// Durable row of the version table, keyed by (key, version_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: String,
    /// Source version id, `$null` for unversioned buckets.
    pub version_id: String,
    pub status: VersionStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    /// Order of the last event that claimed this row.
    pub order_token: OrderToken,
    /// Order of the event that created this version. Set once; absent while
    /// only tag changes or permanent deletions have touched the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_order: Option<OrderToken>,
    /// Identity of the delivery holding (or last holding) the row.
    pub claim: String,
    pub event_kind: EventKind,
    pub lease_expires_at: DateTime<Utc>,
    /// Destination version written for this source version, `$null` when
    /// the destination bucket is unversioned.
    pub destination_version_id: Option<String>,
    pub last_error: Option<String>,
}

impl VersionRecord {
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == VersionStatus::Processing && self.lease_expires_at > now
    }
}

/// What a conditional claim on an existing row would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    Acquire,
    /// The row already reflects this event or a later one.
    AlreadyCompleted,
    /// Another delivery holds a live lease on the row.
    InFlight,
}

/// Precondition of the Processing transition for one (key, version_id).
///
/// This is the single rule every store implementation must enforce
/// atomically: the DynamoDB condition expression and the in-memory test
/// store both encode it.
pub fn decide_claim(
    existing: Option<&VersionRecord>,
    incoming: &OrderToken,
    now: DateTime<Utc>,
) -> ClaimDecision {
    let Some(record) = existing else {
        return ClaimDecision::Acquire;
    };

    match record.status {
        VersionStatus::Failed => ClaimDecision::Acquire,
        VersionStatus::Completed if record.order_token < *incoming => ClaimDecision::Acquire,
        VersionStatus::Completed => ClaimDecision::AlreadyCompleted,
        VersionStatus::Processing if record.lease_expires_at <= now => ClaimDecision::Acquire,
        VersionStatus::Processing => ClaimDecision::InFlight,
    }
}

/// Standing of an event relative to the other versions of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    Proceed,
    /// A newer version already completed; applying this event would roll
    /// the destination back.
    Stale { superseded_by: String },
    /// A newer version is being processed right now.
    NewerInFlight { version_id: String },
}

/// Place of the event's version among the versions of its key.
///
/// A creating event carries it; any other event inherits the position its
/// version was created at, falling back to its own order when the creation
/// was never seen.
pub fn version_position(history: &[VersionRecord], event: &ObjectChangeEvent) -> OrderToken {
    if !event.creates_version() {
        let version_id = event.version_key();
        let created = history
            .iter()
            .find(|record| record.version_id == version_id)
            .and_then(|record| record.version_order.clone());
        if let Some(order) = created {
            return order;
        }
    }
    event.order_token()
}

/// Compares `position` (see [`version_position`]) against the creation
/// order of every other version of the key.
pub fn resolve_key(
    history: &[VersionRecord],
    version_id: &str,
    position: &OrderToken,
    now: DateTime<Utc>,
) -> KeyResolution {
    let newer = history.iter().filter(|record| {
        record.version_id != version_id
            && record
                .version_order
                .as_ref()
                .is_some_and(|order| order > position)
    });

    let mut in_flight: Option<&VersionRecord> = None;
    for record in newer {
        match record.status {
            VersionStatus::Completed => {
                return KeyResolution::Stale {
                    superseded_by: record.version_id.clone(),
                };
            }
            VersionStatus::Processing if record.lease_is_live(now) => {
                in_flight.get_or_insert(record);
            }
            VersionStatus::Processing | VersionStatus::Failed => {}
        }
    }

    match in_flight {
        Some(record) => KeyResolution::NewerInFlight {
            version_id: record.version_id.clone(),
        },
        None => KeyResolution::Proceed,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    fn record(version_id: &str, status: VersionStatus, event_second: i64) -> VersionRecord {
        VersionRecord {
            key: "a.txt".to_string(),
            version_id: version_id.to_string(),
            status,
            attempts: 1,
            updated_at: at(event_second),
            order_token: OrderToken::new(at(event_second), None),
            version_order: Some(OrderToken::new(at(event_second), None)),
            claim: format!("msg-{version_id}"),
            event_kind: EventKind::Created,
            lease_expires_at: at(event_second) + Duration::seconds(900),
            destination_version_id: None,
            last_error: None,
        }
    }

    #[test]
    fn absent_row_is_acquired() {
        let token = OrderToken::new(at(0), None);
        assert_eq!(decide_claim(None, &token, at(0)), ClaimDecision::Acquire);
    }

    #[test]
    fn completed_row_rejects_same_or_older_event() {
        let existing = record("v1", VersionStatus::Completed, 10);
        let same = existing.order_token.clone();
        let older = OrderToken::new(at(5), None);

        assert_eq!(
            decide_claim(Some(&existing), &same, at(20)),
            ClaimDecision::AlreadyCompleted
        );
        assert_eq!(
            decide_claim(Some(&existing), &older, at(20)),
            ClaimDecision::AlreadyCompleted
        );
    }

    #[test]
    fn completed_row_accepts_later_event_on_same_version() {
        let existing = record("v1", VersionStatus::Completed, 10);
        let later = OrderToken::new(at(11), None);
        assert_eq!(
            decide_claim(Some(&existing), &later, at(20)),
            ClaimDecision::Acquire
        );
    }

    #[test]
    fn processing_row_blocks_until_lease_expires() {
        let existing = record("v1", VersionStatus::Processing, 10);
        let token = existing.order_token.clone();

        assert_eq!(
            decide_claim(Some(&existing), &token, at(20)),
            ClaimDecision::InFlight
        );
        assert_eq!(
            decide_claim(Some(&existing), &token, at(10 + 900)),
            ClaimDecision::Acquire
        );
    }

    #[test]
    fn failed_row_is_reacquired() {
        let existing = record("v1", VersionStatus::Failed, 10);
        let token = existing.order_token.clone();
        assert_eq!(
            decide_claim(Some(&existing), &token, at(20)),
            ClaimDecision::Acquire
        );
    }

    #[test]
    fn older_version_is_stale_once_newer_completed() {
        let history = vec![
            record("v1", VersionStatus::Processing, 0),
            record("v2", VersionStatus::Completed, 10),
        ];
        let incoming = OrderToken::new(at(0), None);

        assert_eq!(
            resolve_key(&history, "v1", &incoming, at(30)),
            KeyResolution::Stale {
                superseded_by: "v2".to_string()
            }
        );
    }

    #[test]
    fn newer_live_processing_version_defers_the_event() {
        let history = vec![record("v2", VersionStatus::Processing, 10)];
        let incoming = OrderToken::new(at(0), None);

        assert_eq!(
            resolve_key(&history, "v1", &incoming, at(30)),
            KeyResolution::NewerInFlight {
                version_id: "v2".to_string()
            }
        );
    }

    #[test]
    fn expired_or_failed_newer_versions_do_not_block() {
        let history = vec![
            record("v2", VersionStatus::Processing, 10),
            record("v3", VersionStatus::Failed, 20),
        ];
        let incoming = OrderToken::new(at(0), None);

        assert_eq!(
            resolve_key(&history, "v1", &incoming, at(10 + 901)),
            KeyResolution::Proceed
        );
    }

    #[test]
    fn same_version_rows_are_left_to_the_claim() {
        let history = vec![record("v1", VersionStatus::Completed, 10)];
        let incoming = OrderToken::new(at(0), None);
        assert_eq!(
            resolve_key(&history, "v1", &incoming, at(30)),
            KeyResolution::Proceed
        );
    }

    fn event(kind: EventKind, version_id: &str, event_second: i64) -> ObjectChangeEvent {
        ObjectChangeEvent {
            bucket: "source-data".to_string(),
            key: "a.txt".to_string(),
            version_id: Some(version_id.to_string()),
            kind,
            event_time: at(event_second),
            sequencer: None,
            reason: None,
            deletion_type: None,
        }
    }

    #[test]
    fn later_tag_event_keeps_the_version_in_its_creation_slot() {
        // v1 created at 0 then retagged at 20; its row now carries the tag
        // event's order, but v2 (created at 10) is still the newer version.
        let mut v1 = record("v1", VersionStatus::Completed, 0);
        v1.order_token = OrderToken::new(at(20), None);
        v1.event_kind = EventKind::TagsAdded;
        let history = vec![v1];

        let created_v2 = event(EventKind::Created, "v2", 10);
        let position = version_position(&history, &created_v2);

        assert_eq!(position, OrderToken::new(at(10), None));
        assert_eq!(
            resolve_key(&history, "v2", &position, at(30)),
            KeyResolution::Proceed
        );
    }

    #[test]
    fn tag_event_on_superseded_version_is_stale() {
        let history = vec![
            record("v1", VersionStatus::Completed, 0),
            record("v2", VersionStatus::Completed, 10),
        ];
        let tagged_v1 = event(EventKind::TagsAdded, "v1", 20);
        let position = version_position(&history, &tagged_v1);

        assert_eq!(position, OrderToken::new(at(0), None));
        assert_eq!(
            resolve_key(&history, "v1", &position, at(30)),
            KeyResolution::Stale {
                superseded_by: "v2".to_string()
            }
        );
    }

    #[test]
    fn rows_without_creation_order_never_supersede() {
        // Only a permanent deletion of v1 was ever seen.
        let mut v1 = record("v1", VersionStatus::Completed, 20);
        v1.version_order = None;
        v1.event_kind = EventKind::Deleted;
        let history = vec![v1];

        let created_v2 = event(EventKind::Created, "v2", 10);
        let position = version_position(&history, &created_v2);
        assert_eq!(
            resolve_key(&history, "v2", &position, at(30)),
            KeyResolution::Proceed
        );
    }

    #[test]
    fn unseen_creation_falls_back_to_the_event_order() {
        let tagged = event(EventKind::TagsDeleted, "v7", 15);
        assert_eq!(
            version_position(&[], &tagged),
            OrderToken::new(at(15), None)
        );
    }

    #[test]
    fn status_round_trips_through_table_strings() {
        for status in [
            VersionStatus::Processing,
            VersionStatus::Completed,
            VersionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<VersionStatus>(), Ok(status));
        }
        assert!("Archived".parse::<VersionStatus>().is_err());
    }
}
