/// Failures raised while normalizing or replicating a change event.
///
/// Every variant is caught at the per-item boundary of the worker; only
/// [`ReplicationError::is_retryable`] decides whether the item is redelivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    /// Network failure, throttling, or any other condition expected to clear.
    #[error("transient failure during {operation}: {detail}")]
    TransientInfrastructure { operation: String, detail: String },

    /// The executing identity (source or destination) was refused.
    #[error("permission denied during {operation}: {detail}")]
    PermissionDenied { operation: String, detail: String },

    /// Another event for the same key is still in flight.
    #[error("version {in_flight_version} of '{key}' is still being processed")]
    UnresolvedVersionConflict {
        key: String,
        in_flight_version: String,
    },

    #[error("source object '{key}' (version {version}) not found")]
    SourceObjectMissing { key: String, version: String },

    #[error("destination object '{key}' not found")]
    DestinationObjectMissing { key: String },

    /// Payload that can never be processed, regardless of retries.
    #[error("malformed payload: {detail}")]
    MalformedPayload { detail: String },

    #[error("configuration error: {detail}")]
    Configuration { detail: String },
}

impl ReplicationError {
    pub fn transient(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TransientInfrastructure {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn permission_denied(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedPayload {
            detail: detail.into(),
        }
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::Configuration {
            detail: detail.into(),
        }
    }

    /// Whether the work item should be handed back to the queue.
    ///
    /// Missing objects are resolved by the caller (deletes are idempotent, a
    /// vanished source is superseded by its own delete event), so they are
    /// not retried if they ever escape.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientInfrastructure { .. }
            | Self::PermissionDenied { .. }
            | Self::UnresolvedVersionConflict { .. }
            | Self::Configuration { .. } => true,
            Self::SourceObjectMissing { .. }
            | Self::DestinationObjectMissing { .. }
            | Self::MalformedPayload { .. } => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientInfrastructure { .. } => "transient_infrastructure",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::UnresolvedVersionConflict { .. } => "unresolved_version_conflict",
            Self::SourceObjectMissing { .. } => "source_object_missing",
            Self::DestinationObjectMissing { .. } => "destination_object_missing",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::Configuration { .. } => "configuration",
        }
    }
}
