//! In-process metadata store.
//!
//! Mirrors [`SqliteMetadataStore`] semantics over plain maps, with a
//! write counter so tests can assert that a code path touched (or did
//! not touch) persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::document::{DocumentRecord, PageRecord};

use super::{MetadataError, MetadataStore};

struct MemoryMetadataStoreInner {
    documents: RwLock<HashMap<String, DocumentRecord>>,
    // Keyed by (document, page) so a range scan yields page order.
    pages: RwLock<BTreeMap<(String, u32), PageRecord>>,
    writes: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryMetadataStore {
    inner: Arc<MemoryMetadataStoreInner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryMetadataStoreInner {
                documents: RwLock::new(HashMap::new()),
                pages: RwLock::new(BTreeMap::new()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Number of write operations (document or page) since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    pub async fn page_count(&self) -> usize {
        self.inner.pages.read().await.len()
    }

    fn note_write(&self) {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert_document(&self, document: &DocumentRecord) -> Result<(), MetadataError> {
        self.inner
            .documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        self.note_write();
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, MetadataError> {
        Ok(self.inner.documents.read().await.get(document_id).cloned())
    }

    async fn set_page_count(
        &self,
        document_id: &str,
        page_count: u32,
    ) -> Result<(), MetadataError> {
        if let Some(document) = self.inner.documents.write().await.get_mut(document_id) {
            document.page_count = Some(page_count);
            self.note_write();
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), MetadataError> {
        self.inner.documents.write().await.remove(document_id);
        self.note_write();
        Ok(())
    }

    async fn upsert_page(&self, record: &PageRecord) -> Result<(), MetadataError> {
        self.inner.pages.write().await.insert(
            (record.document_id.clone(), record.page_number),
            record.clone(),
        );
        self.note_write();
        Ok(())
    }

    async fn upsert_pages(&self, records: &[PageRecord]) -> Result<(), MetadataError> {
        // Single lock acquisition stands in for the SQL transaction.
        let mut pages = self.inner.pages.write().await;
        for record in records {
            pages.insert(
                (record.document_id.clone(), record.page_number),
                record.clone(),
            );
            self.note_write();
        }
        Ok(())
    }

    async fn get_page(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<PageRecord>, MetadataError> {
        Ok(self
            .inner
            .pages
            .read()
            .await
            .get(&(document_id.to_string(), page_number))
            .cloned())
    }

    async fn find_pages(&self, document_id: &str) -> Result<Vec<PageRecord>, MetadataError> {
        let pages = self.inner.pages.read().await;
        Ok(pages
            .range((document_id.to_string(), 0)..(document_id.to_string(), u32::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete_page(&self, document_id: &str, page_number: u32) -> Result<(), MetadataError> {
        self.inner
            .pages
            .write()
            .await
            .remove(&(document_id.to_string(), page_number));
        self.note_write();
        Ok(())
    }

    async fn delete_pages(&self, document_id: &str) -> Result<(), MetadataError> {
        let mut pages = self.inner.pages.write().await;
        pages.retain(|(id, _), _| id != document_id);
        self.note_write();
        Ok(())
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, MetadataError> {
        let mut pages = self.inner.pages.write().await;
        let initial = pages.len();
        pages.retain(|_, record| record.expires_at >= before);
        let removed = (initial - pages.len()) as u64;
        if removed > 0 {
            self.note_write();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn page(document_id: &str, page_number: u32) -> PageRecord {
        let now = Utc::now();
        PageRecord {
            document_id: document_id.to_string(),
            page_number,
            blob_key: format!("{document_id}/page-{page_number}"),
            byte_size: 100,
            width: 612,
            height: 792,
            sha256: String::new(),
            created_at: now,
            expires_at: now + Duration::days(7),
        }
    }

    #[tokio::test]
    async fn pages_come_back_in_page_order() {
        let store = MemoryMetadataStore::new();
        store.upsert_page(&page("a", 2)).await.unwrap();
        store.upsert_page(&page("a", 1)).await.unwrap();
        store.upsert_page(&page("b", 1)).await.unwrap();

        let numbers: Vec<u32> = store
            .find_pages("a")
            .await
            .unwrap()
            .iter()
            .map(|record| record.page_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn write_counter_tracks_mutations() {
        let store = MemoryMetadataStore::new();
        assert_eq!(store.write_count(), 0);

        store.upsert_page(&page("a", 1)).await.unwrap();
        store.get_page("a", 1).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn delete_expired_counts_removed_rows() {
        let store = MemoryMetadataStore::new();
        let mut stale = page("a", 1);
        stale.expires_at = Utc::now() - Duration::seconds(5);
        store.upsert_page(&stale).await.unwrap();
        store.upsert_page(&page("a", 2)).await.unwrap();

        assert_eq!(store.delete_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.page_count().await, 1);
    }
}
