use serde::Deserialize;

use crate::adapters::blocking::block_on_sdk;
use crate::adapters::sdk_errors::replication_error;
use crate::runtime::error::ReplicationError;

const DEFAULT_PARTITION: &str = "aws";

/// Delegated identity for the destination partition.
///
/// Fetched per invocation and never persisted; it is the only bridge between
/// the two authorization domains.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct DestinationCredential {
    #[serde(rename = "accessId", alias = "accesskey")]
    pub access_id: String,
    #[serde(rename = "accessSecret", alias = "secretaccesskey")]
    pub access_secret: String,
    #[serde(default = "default_partition")]
    pub partition: String,
}

impl std::fmt::Debug for DestinationCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationCredential")
            .field("access_id", &self.access_id)
            .field("access_secret", &"[REDACTED]")
            .field("partition", &self.partition)
            .finish()
    }
}

fn default_partition() -> String {
    DEFAULT_PARTITION.to_string()
}

pub trait CredentialProvider {
    fn destination_credential(&self) -> Result<DestinationCredential, ReplicationError>;
}

pub fn parse_credential_secret(
    secret_name: &str,
    secret_string: &str,
) -> Result<DestinationCredential, ReplicationError> {
    let credential: DestinationCredential =
        serde_json::from_str(secret_string).map_err(|error| {
            ReplicationError::configuration(format!(
                "secret '{secret_name}' is not a destination credential: {error}"
            ))
        })?;

    if credential.access_id.trim().is_empty() || credential.access_secret.trim().is_empty() {
        return Err(ReplicationError::configuration(format!(
            "secret '{secret_name}' has an empty access id or secret"
        )));
    }

    Ok(credential)
}

pub struct SecretsManagerCredentialProvider {
    client: aws_sdk_secretsmanager::Client,
    secret_id: String,
}

impl SecretsManagerCredentialProvider {
    pub fn new(client: aws_sdk_secretsmanager::Client, secret_id: impl Into<String>) -> Self {
        Self {
            client,
            secret_id: secret_id.into(),
        }
    }
}

impl CredentialProvider for SecretsManagerCredentialProvider {
    fn destination_credential(&self) -> Result<DestinationCredential, ReplicationError> {
        let client = self.client.clone();
        let secret_id = self.secret_id.clone();

        let output = block_on_sdk(async move {
            client
                .get_secret_value()
                .secret_id(secret_id)
                .send()
                .await
        })
        .map_err(|error| {
            replication_error(
                "get_secret_value",
                &error,
                Some(ReplicationError::configuration(format!(
                    "secret '{}' does not exist",
                    self.secret_id
                ))),
            )
        })?;

        let secret_string = output.secret_string().ok_or_else(|| {
            ReplicationError::configuration(format!(
                "secret '{}' has no SecretString",
                self.secret_id
            ))
        })?;

        let credential = parse_credential_secret(&self.secret_id, secret_string)?;
        tracing::debug!(
            component = "credential_provider",
            event = "destination_credential_loaded",
            secret = %self.secret_id,
            partition = %credential.partition,
            version = ?output.version_id(),
        );
        Ok(credential)
    }
}
