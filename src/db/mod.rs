//! Metadata store for SQLite persistence
//!
//! Tracks registered documents and their converted page records. The
//! pipeline only sees the [`MetadataStore`] trait; [`SqliteMetadataStore`]
//! is the durable backend and [`MemoryMetadataStore`] serves tests and
//! embedded use.

mod memory;
mod pages;
mod schema;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

pub use memory::MemoryMetadataStore;
pub use pages::SqliteMetadataStore;
pub use schema::initialize_schema;

use crate::document::{DocumentRecord, PageRecord};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, MetadataError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width UTC strings so that string
/// comparison in SQL matches time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, MetadataError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| MetadataError::InvalidRow(format!("bad timestamp {raw:?}: {err}")))
}

/// Persistence backend for document and page records.
///
/// Page records are the backing truth for the page cache; writes of a
/// whole conversion run go through `upsert_pages` so a run lands
/// atomically or not at all.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_document(&self, document: &DocumentRecord) -> Result<(), MetadataError>;

    async fn get_document(&self, document_id: &str)
        -> Result<Option<DocumentRecord>, MetadataError>;

    async fn set_page_count(&self, document_id: &str, page_count: u32)
        -> Result<(), MetadataError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), MetadataError>;

    async fn upsert_page(&self, record: &PageRecord) -> Result<(), MetadataError>;

    /// Upsert a batch of page records in a single transaction.
    async fn upsert_pages(&self, records: &[PageRecord]) -> Result<(), MetadataError>;

    async fn get_page(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<PageRecord>, MetadataError>;

    /// All page records for a document, ordered by page number.
    async fn find_pages(&self, document_id: &str) -> Result<Vec<PageRecord>, MetadataError>;

    async fn delete_page(&self, document_id: &str, page_number: u32)
        -> Result<(), MetadataError>;

    async fn delete_pages(&self, document_id: &str) -> Result<(), MetadataError>;

    /// Remove every page record whose deadline is before `before`.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, MetadataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        // Sub-microsecond precision is dropped on the way through.
        assert!((now - parsed).num_microseconds().unwrap().abs() < 1);
    }

    #[test]
    fn timestamp_strings_sort_chronologically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(early) < fmt_ts(late));
    }

    #[test]
    fn garbage_timestamp_is_an_invalid_row() {
        assert!(matches!(
            parse_ts("not-a-timestamp"),
            Err(MetadataError::InvalidRow(_))
        ));
    }
}
