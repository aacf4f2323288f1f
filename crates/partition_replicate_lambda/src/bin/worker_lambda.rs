use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use partition_replicate_lambda::adapters::credentials::SecretsManagerCredentialProvider;
use partition_replicate_lambda::adapters::object_store::{S3DestinationConnector, S3SourceObjects};
use partition_replicate_lambda::adapters::version_store::DynamoVersionStore;
use partition_replicate_lambda::config::WorkerConfig;
use partition_replicate_lambda::handlers::worker::{handle_batch, WorkerContext, WorkerDependencies};
use partition_replicate_lambda::logging::init_logging;
use partition_replicate_lambda::runtime::contract::BatchResponse;
use serde_json::Value;

struct WorkerRuntime {
    processing_lease: chrono::Duration,
    version_store: DynamoVersionStore,
    source: S3SourceObjects,
    credentials: SecretsManagerCredentialProvider,
    destination: S3DestinationConnector,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    runtime: &WorkerRuntime,
) -> Result<BatchResponse, Error> {
    let context = WorkerContext {
        now: Utc::now(),
        processing_lease: runtime.processing_lease,
    };
    let dependencies = WorkerDependencies {
        version_store: &runtime.version_store,
        source: &runtime.source,
        credentials: &runtime.credentials,
        destination: &runtime.destination,
    };

    let response = handle_batch(&event.payload, &context, &dependencies)?;
    tracing::info!(
        component = "replication_worker",
        event = "batch_processed",
        request_id = %event.context.request_id,
        failures = response.batch_item_failures.len(),
    );
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = WorkerConfig::from_env()?;
    init_logging(&config.logging);

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let destination = &config.destination;
    let runtime = WorkerRuntime {
        processing_lease: config.processing_lease(),
        version_store: DynamoVersionStore::new(
            aws_sdk_dynamodb::Client::new(&aws_config),
            config.objects_table.clone(),
        ),
        source: S3SourceObjects::new(aws_sdk_s3::Client::new(&aws_config)),
        credentials: SecretsManagerCredentialProvider::new(
            aws_sdk_secretsmanager::Client::new(&aws_config),
            destination.dest_secret.clone(),
        ),
        destination: S3DestinationConnector::new(
            destination.dest_bucket.clone(),
            destination.dest_bucket_region.clone(),
            destination.kms_key_id(),
        ),
    };
    tracing::info!(
        component = "replication_worker",
        event = "function_started",
        table = %config.objects_table,
        dest_bucket = %destination.dest_bucket,
        dest_region = %destination.dest_bucket_region,
        lease_seconds = config.processing_lease_seconds,
    );

    let runtime = &runtime;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, runtime).await
    }))
    .await
}
