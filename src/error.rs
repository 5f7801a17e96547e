//! Crate-wide error type.
//!
//! Subsystems keep their own error enums; [`ServiceError`] is the
//! umbrella the pipeline and facade speak. The recovery layer
//! classifies these into coarse fault kinds, so new variants need a
//! home in [`classify`](crate::recovery::classify) as well.

use std::sync::Arc;

use thiserror::Error;

use crate::access::AccessError;
use crate::cache::CacheError;
use crate::convert::ConvertError;
use crate::db::MetadataError;
use crate::recovery::PageFailure;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Page {page} out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Access(#[from] AccessError),

    /// A page-scoped failure already sanitized by the recovery layer.
    #[error(transparent)]
    Page(#[from] PageFailure),

    /// Outcome shared with every caller joined on one conversion run.
    #[error("{0}")]
    Shared(Arc<ServiceError>),

    #[error("Conversion run for document {0} was interrupted")]
    Interrupted(String),

    #[error("Viewing session not found: {0}")]
    SessionNotFound(uuid::Uuid),
}

impl From<Arc<ServiceError>> for ServiceError {
    fn from(err: Arc<ServiceError>) -> Self {
        ServiceError::Shared(err)
    }
}
