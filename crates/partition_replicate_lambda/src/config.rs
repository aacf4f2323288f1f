use clap::{Args, Parser};

use crate::runtime::error::ReplicationError;
use crate::runtime::filter::EventFilter;

pub const DEFAULT_PROCESSING_LEASE_SECONDS: u64 = 900;
/// SQS caps the visibility timeout at twelve hours.
pub const MAX_PROCESSING_LEASE_SECONDS: u64 = 43_200;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LoggingArgs {
    /// Minimum log level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    #[arg(long, env = "LOGGING_LEVEL", default_value = "INFO")]
    pub logging_level: String,
}

/// Settings of the ingest function.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "ingest_lambda", about = "Filters source bucket notifications into the work queue")]
pub struct IngestConfig {
    /// Watched source bucket
    #[arg(long, env = "SOURCE_BUCKET")]
    pub source_bucket: String,
    /// Comma-separated key prefixes; empty replicates the whole bucket
    #[arg(long, env = "SOURCE_PREFIXES", value_delimiter = ',')]
    pub source_prefixes: Vec<String>,
    /// URL of the FIFO work queue
    #[arg(long, env = "OBJECTS_QUEUE")]
    pub objects_queue: String,
    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ReplicationError> {
        Self::try_parse_from(["ingest_lambda"]).map_err(configuration_error)
    }

    pub fn event_filter(&self) -> EventFilter {
        EventFilter::new(self.source_bucket.clone(), self.source_prefixes.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct DestinationArgs {
    /// Bucket in the destination partition
    #[arg(long, env = "DEST_BUCKET")]
    pub dest_bucket: String,
    #[arg(long, env = "DEST_BUCKET_REGION")]
    pub dest_bucket_region: String,
    /// KMS key for server-side encryption of destination objects
    #[arg(long, env = "DEST_KMS_KEY")]
    pub dest_kms_key: Option<String>,
    /// Secrets Manager name of the destination credential
    #[arg(long, env = "DEST_SECRET")]
    pub dest_secret: String,
}

impl DestinationArgs {
    /// Configured KMS key, treating a blank value as unset.
    pub fn kms_key_id(&self) -> Option<String> {
        self.dest_kms_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }
}

/// Settings of the worker function.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "worker_lambda", about = "Replicates queued object changes to the destination")]
pub struct WorkerConfig {
    #[command(flatten)]
    pub destination: DestinationArgs,
    /// Version store table name
    #[arg(long, env = "OBJECTS_TABLE")]
    pub objects_table: String,
    /// Seconds a Processing claim stays exclusive; match the queue visibility timeout
    #[arg(long, env = "PROCESSING_LEASE_SECONDS", default_value_t = DEFAULT_PROCESSING_LEASE_SECONDS)]
    pub processing_lease_seconds: u64,
    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ReplicationError> {
        Self::try_parse_from(["worker_lambda"]).map_err(configuration_error)
    }

    pub fn processing_lease(&self) -> chrono::Duration {
        let seconds = self.processing_lease_seconds.min(MAX_PROCESSING_LEASE_SECONDS);
        chrono::Duration::seconds(seconds as i64)
    }
}

fn configuration_error(error: clap::Error) -> ReplicationError {
    ReplicationError::configuration(error.to_string())
}
