//! Page cache: a freshness policy over the metadata store.
//!
//! A page record is a cache entry. `put` stamps the freshness
//! deadline, `get`/`list` treat records past it as absent and evict
//! them lazily, and a background sweeper clears whatever lazy eviction
//! never touched. Blob bytes are not duplicated here; entries only
//! point at them.

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::db::{MetadataError, MetadataStore};
use crate::document::PageRecord;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Corrupt page record for {document_id} page {page_number}: {reason}")]
    Corrupt {
        document_id: String,
        page_number: u32,
        reason: String,
    },
}

/// TTL cache of converted pages, backed by the metadata store.
#[derive(Clone)]
pub struct PageCache {
    store: Arc<dyn MetadataStore>,
    ttl: Duration,
    sweep_interval: std::time::Duration,
}

impl PageCache {
    pub fn new(store: Arc<dyn MetadataStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            ttl: config.page_ttl(),
            sweep_interval: config.sweep_interval(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a single page. Expired entries are evicted on the way
    /// through and reported as absent; malformed entries are evicted
    /// and reported as corrupt.
    pub async fn get(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<PageRecord>, CacheError> {
        let Some(record) = self.store.get_page(document_id, page_number).await? else {
            return Ok(None);
        };

        if !record.is_wellformed() {
            self.store.delete_page(document_id, page_number).await?;
            return Err(CacheError::Corrupt {
                document_id: document_id.to_string(),
                page_number,
                reason: "missing addressing fields".to_string(),
            });
        }

        if record.is_expired() {
            debug!(document_id, page_number, "evicting expired page record");
            self.store.delete_page(document_id, page_number).await?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// All live pages of a document, in page order. Expired and
    /// malformed entries are dropped from the result and evicted.
    pub async fn list(&self, document_id: &str) -> Result<Vec<PageRecord>, CacheError> {
        let records = self.store.find_pages(document_id).await?;

        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if !record.is_wellformed() {
                warn!(
                    document_id,
                    page_number = record.page_number,
                    "dropping corrupt page record"
                );
                self.store
                    .delete_page(document_id, record.page_number)
                    .await?;
            } else if record.is_expired() {
                debug!(
                    document_id,
                    page_number = record.page_number,
                    "evicting expired page record"
                );
                self.store
                    .delete_page(document_id, record.page_number)
                    .await?;
            } else {
                live.push(record);
            }
        }

        Ok(live)
    }

    /// Store a record with the default TTL. Returns the stamped record.
    pub async fn put(&self, record: PageRecord) -> Result<PageRecord, CacheError> {
        self.put_with_ttl(record, self.ttl).await
    }

    pub async fn put_with_ttl(
        &self,
        mut record: PageRecord,
        ttl: Duration,
    ) -> Result<PageRecord, CacheError> {
        record.expires_at = Utc::now() + ttl;
        self.store.upsert_page(&record).await?;
        Ok(record)
    }

    /// Store a whole conversion run in one transaction, stamping every
    /// record with the default TTL.
    pub async fn put_batch(&self, records: Vec<PageRecord>) -> Result<Vec<PageRecord>, CacheError> {
        let deadline = Utc::now() + self.ttl;
        let stamped: Vec<PageRecord> = records
            .into_iter()
            .map(|mut record| {
                record.expires_at = deadline;
                record
            })
            .collect();

        self.store.upsert_pages(&stamped).await?;
        Ok(stamped)
    }

    /// Drop every cached page of a document.
    pub async fn invalidate(&self, document_id: &str) -> Result<(), CacheError> {
        self.store.delete_pages(document_id).await?;
        Ok(())
    }

    pub async fn invalidate_page(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<(), CacheError> {
        self.store.delete_page(document_id, page_number).await?;
        Ok(())
    }

    /// Remove every expired record. Returns the eviction count.
    pub async fn sweep(&self) -> Result<u64, CacheError> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "swept expired page records");
        }
        Ok(removed)
    }

    /// Spawn the periodic sweep loop.
    pub fn start_sweeper(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            // First tick fires immediately; skip it.
            interval.tick().await;

            loop {
                interval.tick().await;
                if let Err(err) = self.sweep().await {
                    warn!(error = %err, "page cache sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::db::MemoryMetadataStore;

    fn cache_over(store: MemoryMetadataStore) -> PageCache {
        PageCache::new(Arc::new(store), &CacheConfig::default())
    }

    fn record(page_number: u32) -> PageRecord {
        let now = Utc::now();
        PageRecord {
            document_id: "doc-1".to_string(),
            page_number,
            blob_key: format!("doc-1/page-{page_number}"),
            byte_size: 512,
            width: 918,
            height: 1188,
            sha256: String::new(),
            created_at: now,
            expires_at: now,
        }
    }

    #[tokio::test]
    async fn put_stamps_the_freshness_deadline() {
        let cache = cache_over(MemoryMetadataStore::new());
        let stamped = cache.put(record(1)).await.unwrap();

        let remaining = stamped.expires_at - Utc::now();
        assert!(remaining > Duration::days(6));
        assert!(remaining <= Duration::days(7));
    }

    #[tokio::test]
    async fn fresh_entries_hit() {
        let cache = cache_over(MemoryMetadataStore::new());
        cache.put(record(1)).await.unwrap();

        let hit = cache.get("doc-1", 1).await.unwrap();
        assert_eq!(hit.unwrap().page_number, 1);
    }

    #[tokio::test]
    async fn expired_entries_miss_and_are_evicted() {
        let store = MemoryMetadataStore::new();
        let cache = cache_over(store.clone());
        cache
            .put_with_ttl(record(1), Duration::zero())
            .await
            .unwrap();

        assert!(cache.get("doc-1", 1).await.unwrap().is_none());
        // Lazy eviction removed the row itself.
        assert_eq!(store.page_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_entries_surface_as_corrupt() {
        let store = MemoryMetadataStore::new();
        let cache = cache_over(store.clone());

        let mut broken = record(1);
        broken.blob_key = String::new();
        broken.expires_at = Utc::now() + Duration::days(1);
        store.upsert_page(&broken).await.unwrap();

        let err = cache.get("doc-1", 1).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { page_number: 1, .. }));
        // The poisoned row is gone, so the next read is a clean miss.
        assert!(cache.get("doc-1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_only_live_pages_in_order() {
        let cache = cache_over(MemoryMetadataStore::new());
        cache.put(record(2)).await.unwrap();
        cache.put(record(1)).await.unwrap();
        cache
            .put_with_ttl(record(3), Duration::zero())
            .await
            .unwrap();

        let numbers: Vec<u32> = cache
            .list("doc-1")
            .await
            .unwrap()
            .iter()
            .map(|r| r.page_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn sweep_reports_eviction_count() {
        let cache = cache_over(MemoryMetadataStore::new());
        cache
            .put_with_ttl(record(1), Duration::zero())
            .await
            .unwrap();
        cache
            .put_with_ttl(record(2), Duration::zero())
            .await
            .unwrap();
        cache.put(record(3)).await.unwrap();

        assert_eq!(cache.sweep().await.unwrap(), 2);
        assert_eq!(cache.sweep().await.unwrap(), 0);
    }
}
