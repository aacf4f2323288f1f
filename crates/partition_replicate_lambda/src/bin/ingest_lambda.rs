use lambda_runtime::{service_fn, Error, LambdaEvent};
use partition_replicate_lambda::adapters::queue::SqsWorkQueue;
use partition_replicate_lambda::config::IngestConfig;
use partition_replicate_lambda::handlers::ingest::{handle_ingest_event, IngestOutcome};
use partition_replicate_lambda::logging::init_logging;
use partition_replicate_lambda::runtime::filter::EventFilter;
use serde_json::Value;

struct IngestRuntime {
    filter: EventFilter,
    queue: SqsWorkQueue,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    runtime: &IngestRuntime,
) -> Result<IngestOutcome, Error> {
    handle_ingest_event(&event.payload, &runtime.filter, &runtime.queue).map_err(Error::from)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = IngestConfig::from_env()?;
    init_logging(&config.logging);

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let runtime = IngestRuntime {
        filter: config.event_filter(),
        queue: SqsWorkQueue::new(aws_sdk_sqs::Client::new(&aws_config), config.objects_queue.clone()),
    };
    tracing::info!(
        component = "replication_ingest",
        event = "function_started",
        source_bucket = %config.source_bucket,
        prefixes = ?config.source_prefixes,
    );

    let runtime = &runtime;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, runtime).await
    }))
    .await
}
