use sha2::{Digest, Sha256};

use crate::adapters::blocking::block_on_sdk;
use crate::adapters::sdk_errors::replication_error;
use crate::runtime::contract::WorkItem;
use crate::runtime::error::ReplicationError;

/// SQS limit on `MessageGroupId` length.
pub const MAX_GROUP_ID_LEN: usize = 128;

pub trait WorkQueue {
    /// Submits the item to the ordered queue and returns the message id.
    fn enqueue(&self, item: &WorkItem) -> Result<String, ReplicationError>;
}

/// Transport-safe group id for a work item's group key.
///
/// SQS only accepts up to 128 printable ASCII characters; keys outside that
/// shape are hashed, which still maps every event of one key to one group.
pub fn transport_group_id(group_key: &str) -> String {
    let fits = !group_key.is_empty()
        && group_key.len() <= MAX_GROUP_ID_LEN
        && group_key.chars().all(|c| c.is_ascii_graphic());
    if fits {
        return group_key.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(group_key.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

pub struct SqsWorkQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsWorkQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

impl WorkQueue for SqsWorkQueue {
    fn enqueue(&self, item: &WorkItem) -> Result<String, ReplicationError> {
        let body = serde_json::to_string(item)
            .map_err(|error| ReplicationError::malformed(format!("unencodable work item: {error}")))?;
        let client = self.client.clone();
        let queue_url = self.queue_url.clone();
        let group_id = transport_group_id(&item.group_key);
        let dedup_id = item.dedup_token.clone();

        let output = block_on_sdk(async move {
            client
                .send_message()
                .queue_url(queue_url)
                .message_body(body)
                .message_group_id(group_id)
                .message_deduplication_id(dedup_id)
                .send()
                .await
        })
        .map_err(|error| replication_error("send_message", &error, None))?;

        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| ReplicationError::transient("send_message", "response had no message id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_keys_are_used_as_group_ids() {
        assert_eq!(transport_group_id("reports/2026/a.txt"), "reports/2026/a.txt");
    }

    #[test]
    fn keys_with_spaces_or_unicode_are_hashed_stably() {
        let spaced = transport_group_id("my report.txt");
        assert!(spaced.starts_with("sha256:"));
        assert_eq!(spaced, transport_group_id("my report.txt"));
        assert_ne!(spaced, transport_group_id("my report2.txt"));
        assert!(transport_group_id("résumé.pdf").starts_with("sha256:"));
    }

    #[test]
    fn long_keys_fit_the_transport_limit() {
        let key = "k".repeat(1_024);
        let group_id = transport_group_id(&key);
        assert!(group_id.len() <= MAX_GROUP_ID_LEN);
    }
}
