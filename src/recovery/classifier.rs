//! Fault classification.
//!
//! Collapses every [`ServiceError`] into one of a small set of
//! [`ErrorKind`]s. The mapping is total: a fault that fits nothing
//! specific is `Unknown`, never a panic or a dropped error.

use serde::{Deserialize, Serialize};

use crate::access::AccessError;
use crate::cache::CacheError;
use crate::convert::ConvertError;
use crate::error::ServiceError;
use crate::storage::StorageError;

use super::types::Affordance;

/// Canonical fault kinds the recovery tables are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UrlInvalid,
    UrlExpired,
    ConversionFailed,
    DatabaseError,
    StorageNotFound,
    StorageAccessDenied,
    NetworkTimeout,
    PermissionDenied,
    CacheCorrupted,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UrlInvalid => "URL_INVALID",
            ErrorKind::UrlExpired => "URL_EXPIRED",
            ErrorKind::ConversionFailed => "CONVERSION_FAILED",
            ErrorKind::DatabaseError => "DATABASE_ERROR",
            ErrorKind::StorageNotFound => "STORAGE_NOT_FOUND",
            ErrorKind::StorageAccessDenied => "STORAGE_ACCESS_DENIED",
            ErrorKind::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::CacheCorrupted => "CACHE_CORRUPTED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// The message viewers see when recovery gives up on this kind.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::UrlInvalid => "The page address is no longer valid. Reload to get a fresh one.",
            ErrorKind::UrlExpired => "The page link has expired. Reload to get a fresh one.",
            ErrorKind::ConversionFailed => "This page could not be converted for viewing.",
            ErrorKind::DatabaseError => "A temporary storage issue prevented loading this page.",
            ErrorKind::StorageNotFound => "The page image is missing from storage.",
            ErrorKind::StorageAccessDenied => "Storage declined to serve this page.",
            ErrorKind::NetworkTimeout => "Loading this page took too long.",
            ErrorKind::PermissionDenied => "You do not have permission to view this page.",
            ErrorKind::CacheCorrupted => "The cached copy of this page is unusable.",
            ErrorKind::Unknown => "Something went wrong while loading this page.",
        }
    }

    pub fn affordances(&self) -> &'static [Affordance] {
        match self {
            ErrorKind::PermissionDenied => &[Affordance::Report],
            ErrorKind::ConversionFailed
            | ErrorKind::CacheCorrupted
            | ErrorKind::StorageNotFound
            | ErrorKind::StorageAccessDenied => {
                &[Affordance::Retry, Affordance::Skip, Affordance::Report]
            }
            ErrorKind::UrlInvalid
            | ErrorKind::UrlExpired
            | ErrorKind::DatabaseError
            | ErrorKind::NetworkTimeout
            | ErrorKind::Unknown => &[Affordance::Retry, Affordance::Report],
        }
    }
}

/// Classify any service error into its fault kind.
pub fn classify(error: &ServiceError) -> ErrorKind {
    match error {
        ServiceError::Storage(err) => classify_storage(err),
        ServiceError::Metadata(_) => ErrorKind::DatabaseError,
        ServiceError::Cache(CacheError::Corrupt { .. }) => ErrorKind::CacheCorrupted,
        ServiceError::Cache(CacheError::Metadata(_)) => ErrorKind::DatabaseError,
        ServiceError::Convert(err) => classify_convert(err),
        ServiceError::Access(err) => match err {
            AccessError::Forbidden { .. } => ErrorKind::PermissionDenied,
            AccessError::StaleRecord { .. } => ErrorKind::UrlExpired,
            AccessError::InvalidKey(_) => ErrorKind::UrlInvalid,
            AccessError::Storage(err) => classify_storage(err),
        },
        // Already classified once; keep the original verdict.
        ServiceError::Page(failure) => failure.kind,
        ServiceError::Shared(inner) => classify(inner),
        ServiceError::PageOutOfRange { .. } => ErrorKind::UrlInvalid,
        ServiceError::DocumentNotFound(_)
        | ServiceError::Interrupted(_)
        | ServiceError::SessionNotFound(_) => ErrorKind::Unknown,
    }
}

fn classify_storage(err: &StorageError) -> ErrorKind {
    match err {
        StorageError::NotFound(_) => ErrorKind::StorageNotFound,
        StorageError::AccessDenied(_) => ErrorKind::StorageAccessDenied,
        StorageError::Timeout(_) => ErrorKind::NetworkTimeout,
        StorageError::Signing { .. } => ErrorKind::UrlInvalid,
        StorageError::Backend(_) => ErrorKind::Unknown,
    }
}

fn classify_convert(err: &ConvertError) -> ErrorKind {
    match err {
        // Upload faults are storage faults wearing a conversion coat.
        ConvertError::Upload(storage) => classify_storage(storage),
        _ => ErrorKind::ConversionFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::PageFailure;

    #[test]
    fn storage_faults_map_to_their_kinds() {
        let cases = [
            (StorageError::NotFound("k".into()), ErrorKind::StorageNotFound),
            (
                StorageError::AccessDenied("k".into()),
                ErrorKind::StorageAccessDenied,
            ),
            (StorageError::Timeout("k".into()), ErrorKind::NetworkTimeout),
            (
                StorageError::Signing {
                    key: "k".into(),
                    reason: "r".into(),
                },
                ErrorKind::UrlInvalid,
            ),
            (StorageError::Backend("boom".into()), ErrorKind::Unknown),
        ];

        for (err, expected) in cases {
            assert_eq!(classify(&ServiceError::Storage(err)), expected);
        }
    }

    #[test]
    fn access_faults_split_by_cause() {
        assert_eq!(
            classify(&ServiceError::Access(AccessError::Forbidden {
                document_id: "d".into(),
                user_id: "u".into(),
            })),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify(&ServiceError::Access(AccessError::StaleRecord {
                document_id: "d".into(),
                page_number: 1,
            })),
            ErrorKind::UrlExpired
        );
        assert_eq!(
            classify(&ServiceError::Access(AccessError::InvalidKey(String::new()))),
            ErrorKind::UrlInvalid
        );
    }

    #[test]
    fn conversion_upload_faults_stay_storage_faults() {
        let err = ServiceError::Convert(ConvertError::Upload(StorageError::NotFound("k".into())));
        assert_eq!(classify(&err), ErrorKind::StorageNotFound);

        let err = ServiceError::Convert(ConvertError::EmptyDocument);
        assert_eq!(classify(&err), ErrorKind::ConversionFailed);

        // A render deadline is a conversion fault, not a network one.
        let err = ServiceError::Convert(ConvertError::Timeout(30));
        assert_eq!(classify(&err), ErrorKind::ConversionFailed);
    }

    #[test]
    fn corrupt_cache_rows_have_their_own_kind() {
        let err = ServiceError::Cache(CacheError::Corrupt {
            document_id: "d".into(),
            page_number: 2,
            reason: "r".into(),
        });
        assert_eq!(classify(&err), ErrorKind::CacheCorrupted);
    }

    #[test]
    fn sanitized_failures_keep_their_verdict() {
        let failure = PageFailure::terminal(4, ErrorKind::NetworkTimeout, 2);
        assert_eq!(
            classify(&ServiceError::Page(failure)),
            ErrorKind::NetworkTimeout
        );
    }

    #[test]
    fn shared_outcomes_classify_through_the_arc() {
        let inner = ServiceError::Storage(StorageError::NotFound("k".into()));
        let shared = ServiceError::Shared(std::sync::Arc::new(inner));
        assert_eq!(classify(&shared), ErrorKind::StorageNotFound);
    }

    #[test]
    fn unmatched_faults_fall_through_to_unknown() {
        assert_eq!(
            classify(&ServiceError::DocumentNotFound("d".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn kind_codes_use_screaming_case_on_the_wire() {
        let json = serde_json::to_value(ErrorKind::UrlExpired).unwrap();
        assert_eq!(json, "URL_EXPIRED");
    }
}
