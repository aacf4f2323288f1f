use crate::contract::{EventKind, ObjectChangeEvent, DELETE_OBJECT_REASON};

/// Why a change notification does not become a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedEventKind { detail_type: String },
    BucketMismatch { bucket: String },
    PrefixMismatch,
    LifecycleDeletion { reason: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedEventKind { detail_type } => {
                write!(f, "unsupported event type '{detail_type}'")
            }
            Self::BucketMismatch { bucket } => write!(f, "bucket '{bucket}' is not replicated"),
            Self::PrefixMismatch => f.write_str("key matches no replicated prefix"),
            Self::LifecycleDeletion { reason } => {
                write!(f, "deletion reason '{reason}' is not replicated")
            }
        }
    }
}

/// Watched bucket and key prefixes. An empty prefix list watches every key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    source_bucket: String,
    prefixes: Vec<String>,
}

impl EventFilter {
    pub fn new(source_bucket: impl Into<String>, prefixes: Vec<String>) -> Self {
        let prefixes = prefixes
            .into_iter()
            .map(|prefix| prefix.trim().to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect();
        Self {
            source_bucket: source_bucket.into(),
            prefixes,
        }
    }

    pub fn source_bucket(&self) -> &str {
        &self.source_bucket
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }

    pub fn evaluate(&self, event: &ObjectChangeEvent) -> Result<(), SkipReason> {
        if event.bucket != self.source_bucket {
            return Err(SkipReason::BucketMismatch {
                bucket: event.bucket.clone(),
            });
        }

        if !self.matches_key(&event.key) {
            return Err(SkipReason::PrefixMismatch);
        }

        if event.kind == EventKind::Deleted {
            let reason = event.reason.as_deref().unwrap_or("(unknown)");
            if reason != DELETE_OBJECT_REASON {
                return Err(SkipReason::LifecycleDeletion {
                    reason: reason.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn event(bucket: &str, key: &str, kind: EventKind, reason: Option<&str>) -> ObjectChangeEvent {
        ObjectChangeEvent {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id: Some("v1".to_string()),
            kind,
            event_time: Utc
                .with_ymd_and_hms(2026, 2, 14, 10, 0, 0)
                .single()
                .expect("valid time"),
            sequencer: None,
            reason: reason.map(str::to_string),
            deletion_type: None,
        }
    }

    #[test]
    fn empty_prefix_list_accepts_every_key() {
        let filter = EventFilter::new("source-bucket", vec![String::new(), " ".to_string()]);
        assert!(filter.prefixes().is_empty());
        assert_eq!(
            filter.evaluate(&event("source-bucket", "any/key", EventKind::Created, None)),
            Ok(())
        );
    }

    #[test]
    fn keys_outside_configured_prefixes_are_skipped() {
        let filter = EventFilter::new(
            "source-bucket",
            vec!["reports/".to_string(), "exports/".to_string()],
        );

        assert_eq!(
            filter.evaluate(&event("source-bucket", "exports/x.csv", EventKind::Created, None)),
            Ok(())
        );
        assert_eq!(
            filter.evaluate(&event("source-bucket", "tmp/x.csv", EventKind::Created, None)),
            Err(SkipReason::PrefixMismatch)
        );
    }

    #[test]
    fn other_buckets_are_skipped() {
        let filter = EventFilter::new("source-bucket", Vec::new());
        assert_eq!(
            filter.evaluate(&event("other-bucket", "a.txt", EventKind::Created, None)),
            Err(SkipReason::BucketMismatch {
                bucket: "other-bucket".to_string()
            })
        );
    }

    #[test]
    fn lifecycle_expirations_are_skipped() {
        let filter = EventFilter::new("source-bucket", Vec::new());

        assert_eq!(
            filter.evaluate(&event(
                "source-bucket",
                "a.txt",
                EventKind::Deleted,
                Some("Lifecycle Expiration")
            )),
            Err(SkipReason::LifecycleDeletion {
                reason: "Lifecycle Expiration".to_string()
            })
        );
        assert_eq!(
            filter.evaluate(&event(
                "source-bucket",
                "a.txt",
                EventKind::Deleted,
                Some("DeleteObject")
            )),
            Ok(())
        );
    }
}
