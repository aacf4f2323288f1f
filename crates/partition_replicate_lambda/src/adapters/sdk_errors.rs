use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

use crate::runtime::error::ReplicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    PermissionDenied,
    NotFound,
    Transient,
}

const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "Forbidden",
    "403",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "UnrecognizedClientException",
    "AllAccessDisabled",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchKey",
    "NoSuchVersion",
    "NotFound",
    "404",
    "ResourceNotFoundException",
];

pub fn classify_error_code(code: Option<&str>) -> FailureClass {
    match code {
        Some(code) if PERMISSION_CODES.contains(&code) => FailureClass::PermissionDenied,
        Some(code) if NOT_FOUND_CODES.contains(&code) => FailureClass::NotFound,
        _ => FailureClass::Transient,
    }
}

/// Only service errors carry a code; dispatch, timeout and response errors
/// are always treated as transient.
pub fn classify_sdk_error<E, R>(error: &SdkError<E, R>) -> FailureClass
where
    E: ProvideErrorMetadata,
{
    match error {
        SdkError::ServiceError(service) => classify_error_code(service.err().code()),
        _ => FailureClass::Transient,
    }
}

/// Maps an SDK failure into the replication taxonomy. `when_missing` is
/// returned for not-found responses; without it they count as transient.
pub fn replication_error<E, R>(
    operation: &str,
    error: &SdkError<E, R>,
    when_missing: Option<ReplicationError>,
) -> ReplicationError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = DisplayErrorContext(error).to_string();
    match (classify_sdk_error(error), when_missing) {
        (FailureClass::PermissionDenied, _) => ReplicationError::permission_denied(operation, detail),
        (FailureClass::NotFound, Some(missing)) => missing,
        (FailureClass::NotFound, None) | (FailureClass::Transient, _) => {
            ReplicationError::transient(operation, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_is_a_permission_failure() {
        assert_eq!(
            classify_error_code(Some("AccessDenied")),
            FailureClass::PermissionDenied
        );
        assert_eq!(
            classify_error_code(Some("AccessDeniedException")),
            FailureClass::PermissionDenied
        );
    }

    #[test]
    fn missing_keys_and_versions_are_not_found() {
        assert_eq!(classify_error_code(Some("NoSuchKey")), FailureClass::NotFound);
        assert_eq!(
            classify_error_code(Some("NoSuchVersion")),
            FailureClass::NotFound
        );
    }

    #[test]
    fn throttling_and_unknown_codes_are_transient() {
        assert_eq!(
            classify_error_code(Some("SlowDown")),
            FailureClass::Transient
        );
        assert_eq!(
            classify_error_code(Some("ProvisionedThroughputExceededException")),
            FailureClass::Transient
        );
        assert_eq!(classify_error_code(None), FailureClass::Transient);
    }
}
