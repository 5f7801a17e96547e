//! Core document and page records shared across the pipeline.
//!
//! A document is a registered PDF whose source bytes live in the blob
//! store. Pages are derived artifacts: rendered, compressed images
//! uploaded alongside the source and tracked in the metadata store
//! with a freshness deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    /// Stable identifier, also the blob key prefix for derived artifacts.
    pub id: String,
    pub title: String,
    /// Blob key of the original PDF bytes.
    pub source_key: String,
    /// Total page count, known once the document has been opened at least once.
    pub page_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            source_key: source_key.into(),
            page_count: None,
            created_at: Utc::now(),
        }
    }
}

/// A converted page image tracked by the metadata store.
///
/// `expires_at` is the cache deadline: a record past it is treated as
/// absent and lazily evicted on the next read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub document_id: String,
    /// 1-based page number.
    pub page_number: u32,
    /// Blob key of the rendered image.
    pub blob_key: String,
    pub byte_size: u64,
    /// Pixel dimensions. Zero when unknown (e.g. records rebuilt from a
    /// blob listing).
    pub width: u32,
    pub height: u32,
    /// Hex SHA-256 of the image bytes. Empty when unknown.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PageRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// A stored record that lost its addressing fields cannot be served
    /// or re-signed and must be treated as corrupt.
    pub fn is_wellformed(&self) -> bool {
        self.page_number >= 1 && !self.blob_key.is_empty() && !self.document_id.is_empty()
    }
}
