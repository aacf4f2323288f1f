use std::sync::Barrier;

use partition_replicate_lambda::handlers::ingest::{handle_ingest_event, IngestOutcome};
use partition_replicate_lambda::handlers::worker::{handle_batch, WorkerDependencies};
use partition_replicate_lambda::runtime::contract::{BatchResponse, EventKind, NULL_VERSION_ID};
use partition_replicate_lambda::runtime::error::ReplicationError;
use partition_replicate_lambda::runtime::filter::EventFilter;
use partition_replicate_lambda::runtime::version::VersionStatus;
use partition_replicate_lambda::test_helpers::{
    at, batch_event, change_event, notification_at, queued, worker_context, DestinationCall,
    InMemoryDestination, InMemorySource, InMemoryVersionStore, RecordingQueue, StaticCredentials,
    SOURCE_BUCKET,
};
use serde_json::{json, Value};

struct Pipeline {
    filter: EventFilter,
    queue: RecordingQueue,
    store: InMemoryVersionStore,
    source: InMemorySource,
    credentials: StaticCredentials,
    destination: InMemoryDestination,
}

impl Pipeline {
    fn new(destination: InMemoryDestination) -> Self {
        Self {
            filter: EventFilter::new(SOURCE_BUCKET, vec!["reports/".to_string()]),
            queue: RecordingQueue::new(),
            store: InMemoryVersionStore::new(),
            source: InMemorySource::new(),
            credentials: StaticCredentials::new(),
            destination,
        }
    }

    fn ingest(&self, notification: Value) -> IngestOutcome {
        handle_ingest_event(&notification, &self.filter, &self.queue).expect("ingest should succeed")
    }

    fn dependencies(&self) -> WorkerDependencies<'_> {
        WorkerDependencies {
            version_store: &self.store,
            source: &self.source,
            credentials: &self.credentials,
            destination: &self.destination,
        }
    }

    fn work(&self, batch: &Value, now_offset: i64) -> BatchResponse {
        handle_batch(batch, &worker_context(at(now_offset)), &self.dependencies())
            .expect("batch should be processed")
    }
}

#[test]
fn created_object_flows_from_notification_to_destination() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline
        .source
        .put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"a,b\n1,2\n", &[("owner", "finance")]);

    let outcome = pipeline.ingest(notification_at(
        EventKind::Created,
        SOURCE_BUCKET,
        "reports/q1.csv",
        Some("v1"),
        at(0),
    ));
    assert!(matches!(outcome, IngestOutcome::Queued { .. }));

    let response = pipeline.work(&pipeline.queue.batch_event(), 5);

    assert!(response.batch_item_failures.is_empty());
    let replica = pipeline
        .destination
        .current("reports/q1.csv")
        .expect("replica should exist");
    assert_eq!(replica.body, b"a,b\n1,2\n");
    assert_eq!(replica.metadata.content_type.as_deref(), Some("text/plain"));
    assert_eq!(replica.tags.get("owner").map(String::as_str), Some("finance"));

    let record = pipeline
        .store
        .record("reports/q1.csv", "v1")
        .expect("row should exist");
    assert_eq!(record.status, VersionStatus::Completed);
    assert_eq!(record.destination_version_id, Some(replica.version_id));
}

#[test]
fn out_of_order_versions_leave_the_newest_content() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"old", &[]);
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v2"), b"new", &[]);

    // v2 is delivered first, v1 afterwards.
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v2"), at(10)));
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));

    let response = pipeline.work(&pipeline.queue.batch_event(), 20);

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        pipeline.destination.current("reports/q1.csv").map(|object| object.body),
        Some(b"new".to_vec())
    );
    assert_eq!(pipeline.destination.put_count(), 1);
    assert!(pipeline.store.record("reports/q1.csv", "v1").is_none());
}

#[test]
fn tag_change_on_old_version_does_not_hold_back_newer_version() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"old", &[]);
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v2"), b"new", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    pipeline.work(&pipeline.queue.batch_event(), 5);

    // v1 is retagged after v2 was written, but the tag event is delivered first.
    pipeline
        .source
        .set_tags(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), &[("archived", "yes")]);
    pipeline.ingest(notification_at(EventKind::TagsAdded, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(20)));
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v2"), at(10)));

    let response = pipeline.work(&pipeline.queue.batch_event(), 30);

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        pipeline.destination.current("reports/q1.csv").map(|object| object.body),
        Some(b"new".to_vec())
    );
    assert_eq!(
        pipeline.store.record("reports/q1.csv", "v2").map(|r| r.status),
        Some(VersionStatus::Completed)
    );
}

#[test]
fn permanent_delete_of_old_version_does_not_hold_back_newer_version() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"old", &[]);
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v2"), b"new", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    pipeline.work(&pipeline.queue.batch_event(), 5);

    pipeline.source.remove(SOURCE_BUCKET, "reports/q1.csv", Some("v1"));
    let mut purge = notification_at(EventKind::Deleted, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(20));
    purge["detail"]["deletion-type"] = json!("Permanently Deleted");
    pipeline.ingest(purge);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v2"), at(10)));

    let response = pipeline.work(&pipeline.queue.batch_event(), 30);

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(
        pipeline.destination.current("reports/q1.csv").map(|object| object.body),
        Some(b"new".to_vec())
    );
    assert_eq!(pipeline.destination.versions("reports/q1.csv").len(), 1);
}

#[test]
fn failing_item_is_the_only_one_redelivered() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    for index in 1..=5 {
        let key = format!("reports/part-{index}.csv");
        pipeline.source.put(SOURCE_BUCKET, &key, Some("v1"), key.as_bytes(), &[]);
        pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, &key, Some("v1"), at(index)));
    }
    pipeline.destination.fail_key(
        "reports/part-3.csv",
        ReplicationError::transient("put_object", "SlowDown"),
    );

    let batch = pipeline.queue.batch_event();
    let response = pipeline.work(&batch, 10);

    assert_eq!(response.failed_ids(), vec!["msg-3"]);
    assert_eq!(
        pipeline.store.record("reports/part-3.csv", "v1").map(|r| r.status),
        Some(VersionStatus::Failed)
    );

    pipeline.destination.clear_failures();
    let retry = pipeline.work(&batch, 60);

    assert!(retry.batch_item_failures.is_empty());
    assert!(pipeline.destination.current("reports/part-3.csv").is_some());
    // Only the failed item wrote again.
    assert_eq!(pipeline.destination.put_count(), 6);
}

#[test]
fn keys_outside_prefixes_never_reach_the_queue() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());

    let outcome = pipeline.ingest(notification_at(
        EventKind::Created,
        SOURCE_BUCKET,
        "scratch/tmp.csv",
        Some("v1"),
        at(0),
    ));

    assert!(matches!(outcome, IngestOutcome::Skipped { .. }));
    assert!(pipeline.queue.items().is_empty());
}

#[test]
fn redelivered_batch_makes_no_destination_calls() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"data", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    let batch = pipeline.queue.batch_event();

    pipeline.work(&batch, 5);
    let calls = pipeline.destination.calls();
    let response = pipeline.work(&batch, 30);

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(pipeline.destination.calls(), calls);
}

#[test]
fn concurrent_deliveries_write_the_destination_once() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"data", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    let batch = pipeline.queue.batch_event();
    let barrier = Barrier::new(2);

    let responses: Vec<BatchResponse> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    pipeline.work(&batch, 5)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("worker thread should finish"))
            .collect()
    });

    assert_eq!(pipeline.destination.put_count(), 1);
    let redelivered: usize = responses
        .iter()
        .map(|response| response.batch_item_failures.len())
        .sum();
    assert!(redelivered <= 1);
    assert_eq!(
        pipeline.store.record("reports/q1.csv", "v1").map(|r| r.status),
        Some(VersionStatus::Completed)
    );
}

#[test]
fn deleting_an_absent_object_is_idempotent() {
    let pipeline = Pipeline::new(InMemoryDestination::unversioned());

    let first = pipeline.work(
        &batch_event(vec![queued(
            "m-1",
            change_event(EventKind::Deleted, "reports/never.csv", None, at(0)),
        )]),
        5,
    );
    let second = pipeline.work(
        &batch_event(vec![queued(
            "m-2",
            change_event(EventKind::Deleted, "reports/never.csv", None, at(10)),
        )]),
        15,
    );

    assert!(first.batch_item_failures.is_empty());
    assert!(second.batch_item_failures.is_empty());
    let record = pipeline
        .store
        .record("reports/never.csv", NULL_VERSION_ID)
        .expect("row should exist");
    assert_eq!(record.status, VersionStatus::Completed);
    assert_eq!(record.event_kind, EventKind::Deleted);
    assert_eq!(
        pipeline.destination.calls(),
        vec![
            DestinationCall::DeleteObject {
                key: "reports/never.csv".to_string(),
                version_id: None,
            },
            DestinationCall::DeleteObject {
                key: "reports/never.csv".to_string(),
                version_id: None,
            },
        ]
    );
}

#[test]
fn delete_marker_follows_replicated_creation() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"data", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    pipeline.ingest(notification_at(
        EventKind::Deleted,
        SOURCE_BUCKET,
        "reports/q1.csv",
        Some("marker-1"),
        at(10),
    ));

    let response = pipeline.work(&pipeline.queue.batch_event(), 20);

    assert!(response.batch_item_failures.is_empty());
    assert!(pipeline.destination.current("reports/q1.csv").is_none());
    let versions = pipeline.destination.versions("reports/q1.csv");
    assert_eq!(versions.len(), 2);
    assert!(versions[1].delete_marker);
}

#[test]
fn denied_destination_retries_the_whole_batch_with_one_secret_read() {
    let pipeline = Pipeline::new(
        InMemoryDestination::versioned()
            .denying(ReplicationError::permission_denied("put_object", "AccessDenied")),
    );
    for index in 1..=3 {
        let key = format!("reports/part-{index}.csv");
        pipeline.source.put(SOURCE_BUCKET, &key, Some("v1"), b"x", &[]);
        pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, &key, Some("v1"), at(index)));
    }

    let response = pipeline.work(&pipeline.queue.batch_event(), 10);

    assert_eq!(response.failed_ids(), vec!["msg-1", "msg-2", "msg-3"]);
    assert_eq!(pipeline.credentials.fetch_count(), 1);
    assert_eq!(pipeline.destination.connect_count(), 0);
}

#[test]
fn source_removed_before_replication_completes_as_no_op() {
    let pipeline = Pipeline::new(InMemoryDestination::versioned());
    pipeline.source.put(SOURCE_BUCKET, "reports/q1.csv", Some("v1"), b"data", &[]);
    pipeline.ingest(notification_at(EventKind::Created, SOURCE_BUCKET, "reports/q1.csv", Some("v1"), at(0)));
    pipeline.source.remove(SOURCE_BUCKET, "reports/q1.csv", Some("v1"));

    let response = pipeline.work(&pipeline.queue.batch_event(), 5);

    assert!(response.batch_item_failures.is_empty());
    assert_eq!(pipeline.destination.put_count(), 0);
    assert_eq!(
        pipeline.store.record("reports/q1.csv", "v1").map(|r| r.status),
        Some(VersionStatus::Completed)
    );
}
