//! Lambda functions that mirror a watched S3 bucket into a bucket in another
//! AWS partition.
//!
//! `ingest_lambda` turns bucket notifications into FIFO queue messages, one
//! message group per object key. `worker_lambda` drains those messages,
//! claims each object version in DynamoDB and writes the destination with a
//! credential read from Secrets Manager. The handlers only see the traits in
//! [`adapters`], so the whole flow runs against in-memory fakes in tests.
//! [`runtime`] re-exports the AWS-free rules from `partition_replicate_core`.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod runtime;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;
