//! Storage module for S3-compatible blob backends
//!
//! Supports MinIO, Cloudflare R2, Backblaze B2, and AWS S3 through
//! [`S3BlobStore`], plus an in-process [`MemoryBlobStore`] for tests
//! and embedded use. Pipeline code only sees the [`BlobStore`] trait.

pub mod keys;
mod memory;
mod s3_client;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBlobStore;
pub use s3_client::S3BlobStore;
pub use types::*;

/// Errors surfaced by blob backends.
///
/// Variants are deliberately coarse: callers route on the class of
/// fault (missing, denied, slow), not on backend-specific detail.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied for object: {0}")]
    AccessDenied(String),

    #[error("Storage request timed out: {0}")]
    Timeout(String),

    #[error("Failed to sign URL for object {key}: {reason}")]
    Signing { key: String, reason: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Content-addressable blob backend.
///
/// Keys are opaque slash-separated strings (see [`keys`] for the
/// layout used by the pipeline). `signed_url` mints a time-limited URL
/// a viewer can fetch the object through without holding credentials.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List objects under a key prefix, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError>;

    /// Mint a signed GET URL valid for `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}
