//! Cache-aside conversion with single-flight jobs.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::access::ViewerRole;
use crate::cache::PageCache;
use crate::convert::PageConverter;
use crate::db::MetadataStore;
use crate::document::{DocumentRecord, PageRecord};
use crate::error::{Result, ServiceError};
use crate::recovery::{classify, ErrorContext, PageFailure, RecoveryEngine, ViewSurface};
use crate::storage::BlobStore;

use super::registry::{JobEntry, JobOutcome, JobRegistry};

/// Outcome of `ensure_pages`: every page the document now has, plus a
/// failure entry per page that could not be produced. Partial results
/// are always explicit; a missing page never goes unmentioned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsuredPages {
    pub pages: Vec<PageRecord>,
    pub failures: Vec<PageFailure>,
}

impl EnsuredPages {
    /// True when pages 1..=total exist with no gaps and nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && is_contiguous(&self.pages)
    }

    pub fn page(&self, page_number: u32) -> Option<&PageRecord> {
        self.pages
            .iter()
            .find(|record| record.page_number == page_number)
    }
}

fn is_contiguous(pages: &[PageRecord]) -> bool {
    pages
        .iter()
        .enumerate()
        .all(|(index, record)| record.page_number == index as u32 + 1)
}

/// Ensures a document's pages exist, exactly once per concurrent
/// demand.
pub struct ConversionCoordinator {
    blob: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: PageCache,
    converter: Arc<PageConverter>,
    engine: Arc<RecoveryEngine>,
    registry: JobRegistry,
}

impl ConversionCoordinator {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        cache: PageCache,
        converter: Arc<PageConverter>,
        engine: Arc<RecoveryEngine>,
        registry: JobRegistry,
    ) -> Self {
        Self {
            blob,
            metadata,
            cache,
            converter,
            engine,
            registry,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Make every page of the document exist, converting at most once
    /// per concurrent demand.
    ///
    /// A fully cached document returns without touching the blob store
    /// or starting a job. Otherwise the caller joins the in-flight
    /// conversion or starts one on a detached task, so dropping this
    /// future never aborts a run other callers are waiting on.
    pub async fn ensure_pages(self: &Arc<Self>, document_id: &str) -> Result<EnsuredPages> {
        let document = self.require_document(document_id).await?;

        if let Some(cached) = self.cached_complete(&document).await? {
            debug!(document_id, pages = cached.pages.len(), "cache covers document");
            return Ok(cached);
        }

        let rx = match self.registry.join_or_start(document_id).await {
            JobEntry::Join(rx) => rx,
            JobEntry::Lead(ticket) => {
                let rx = ticket.subscribe();
                let coordinator = self.clone();
                let document = document.clone();
                // Detached: callers may vanish, the job runs to
                // completion for whoever remains.
                tokio::spawn(async move {
                    let outcome = coordinator.convert_run(&document).await;
                    ticket.publish(outcome).await;
                });
                rx
            }
        };

        match JobRegistry::await_outcome(rx, document_id).await {
            Ok(ensured) => Ok(ensured),
            Err(shared) => Err(ServiceError::Shared(shared)),
        }
    }

    /// Make a single page exist. A cache hit skips the document-level
    /// job entirely; a miss escalates to `ensure_pages`.
    pub async fn ensure_page(
        self: &Arc<Self>,
        document_id: &str,
        page_number: u32,
    ) -> Result<PageRecord> {
        if page_number < 1 {
            return Err(ServiceError::PageOutOfRange {
                page: page_number,
                total: 0,
            });
        }

        if let Some(record) = self.cache.get(document_id, page_number).await? {
            return Ok(record);
        }

        let ensured = self.ensure_pages(document_id).await?;
        if let Some(record) = ensured.page(page_number) {
            return Ok(record.clone());
        }

        if let Some(failure) = ensured
            .failures
            .iter()
            .find(|failure| failure.page_number == page_number)
        {
            return Err(ServiceError::Page(failure.clone()));
        }

        Err(ServiceError::PageOutOfRange {
            page: page_number,
            total: ensured.pages.len() as u32,
        })
    }

    async fn require_document(&self, document_id: &str) -> Result<DocumentRecord> {
        self.metadata
            .get_document(document_id)
            .await?
            .ok_or_else(|| ServiceError::DocumentNotFound(document_id.to_string()))
    }

    /// A pure cache read: returns the page set only when the known
    /// page count is fully covered by live records.
    async fn cached_complete(&self, document: &DocumentRecord) -> Result<Option<EnsuredPages>> {
        let Some(total) = document.page_count else {
            return Ok(None);
        };

        let pages = self.cache.list(&document.id).await?;
        if pages.len() as u32 == total && is_contiguous(&pages) {
            return Ok(Some(EnsuredPages {
                pages,
                failures: Vec::new(),
            }));
        }

        Ok(None)
    }

    /// The conversion job body. Runs detached; the outcome is shared
    /// with every waiter through the registry.
    async fn convert_run(&self, document: &DocumentRecord) -> JobOutcome {
        match self.convert_run_inner(document).await {
            Ok(ensured) => Ok(ensured),
            Err(err) => {
                warn!(
                    document_id = %document.id,
                    error = %err,
                    "conversion run failed"
                );
                Err(Arc::new(err))
            }
        }
    }

    async fn convert_run_inner(&self, document: &DocumentRecord) -> Result<EnsuredPages> {
        // A racing job may have finished between our cache check and
        // winning the ticket.
        if let Some(cached) = self.cached_complete(document).await? {
            return Ok(cached);
        }

        let source = self.blob.get(&document.source_key).await?;
        let report = self.converter.convert_document(&document.id, &source).await?;

        if document.page_count != Some(report.total_pages) {
            self.metadata
                .set_page_count(&document.id, report.total_pages)
                .await?;
        }

        let mut records = report.records;
        let mut failures = Vec::new();

        // Per-page recovery for whatever the converter could not
        // produce. Only a record-bearing recovery reclaims the page;
        // placeholders are a viewer affordance, not a cached page.
        for failed in report.failures {
            let error = ServiceError::Convert(failed.error);
            let kind = classify(&error);
            let ctx = ErrorContext::new(
                &document.id,
                failed.page_number,
                // System-initiated; no viewer is attached to the run.
                ViewerRole::Admin,
                ViewSurface::Pipeline,
                error.to_string(),
            );

            let result = self.engine.handle(kind, &ctx).await;
            match result.record {
                Some(record) if result.success => records.push(record),
                _ => {
                    failures.push(PageFailure::terminal(
                        failed.page_number,
                        kind,
                        result.attempts,
                    ));
                }
            }
        }

        records.sort_by_key(|record| record.page_number);
        records.dedup_by_key(|record| record.page_number);

        let pages = self.cache.put_batch(records).await?;

        info!(
            document_id = %document.id,
            total = report.total_pages,
            cached = pages.len(),
            failed = failures.len(),
            "conversion run complete"
        );

        Ok(EnsuredPages { pages, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessGate, AllowAll};
    use crate::config::Config;
    use crate::db::{MemoryMetadataStore, MetadataStore};
    use crate::storage::MemoryBlobStore;

    fn minimal_pdf() -> Vec<u8> {
        b"%PDF-1.4
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj
2 0 obj
<< /Type /Pages /Kids [3 0 R] /Count 1 >>
endobj
3 0 obj
<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << >> >>
endobj
4 0 obj
<< /Length 0 >>
stream
endstream
endobj
xref
0 5
0000000000 65535 f
0000000009 00000 n
0000000058 00000 n
0000000115 00000 n
0000000226 00000 n
trailer
<< /Size 5 /Root 1 0 R >>
startxref
276
%%EOF"
        .to_vec()
    }

    struct Fixture {
        blob: MemoryBlobStore,
        metadata: MemoryMetadataStore,
        coordinator: Arc<ConversionCoordinator>,
    }

    fn fixture() -> Fixture {
        let config = Config::default();
        let blob = MemoryBlobStore::new();
        let metadata = MemoryMetadataStore::new();
        let blob_arc: Arc<dyn BlobStore> = Arc::new(blob.clone());
        let metadata_arc: Arc<dyn MetadataStore> = Arc::new(metadata.clone());

        let cache = PageCache::new(metadata_arc.clone(), &config.cache);
        let converter = Arc::new(PageConverter::new(blob_arc.clone(), config.convert.clone()));
        let gate = AccessGate::new(blob_arc.clone(), Arc::new(AllowAll), config.access.clone());
        let engine = Arc::new(RecoveryEngine::new(
            blob_arc.clone(),
            metadata_arc.clone(),
            cache.clone(),
            converter.clone(),
            gate,
            config.recovery.clone(),
        ));

        let coordinator = Arc::new(ConversionCoordinator::new(
            blob_arc,
            metadata_arc,
            cache,
            converter,
            engine,
            JobRegistry::new(),
        ));

        Fixture {
            blob,
            metadata,
            coordinator,
        }
    }

    async fn register(fx: &Fixture, document_id: &str) {
        fx.blob
            .put(
                &format!("{document_id}/source.pdf"),
                minimal_pdf(),
                "application/pdf",
            )
            .await
            .unwrap();
        fx.metadata
            .upsert_document(&DocumentRecord::new(
                document_id,
                "Test",
                format!("{document_id}/source.pdf"),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_document_is_rejected() {
        let fx = fixture();
        let err = fx.coordinator.ensure_pages("ghost").await.unwrap_err();
        assert!(matches!(err, ServiceError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn first_call_converts_and_caches() {
        let fx = fixture();
        register(&fx, "doc-1").await;

        let ensured = fx.coordinator.ensure_pages("doc-1").await.unwrap();
        assert!(ensured.is_complete());
        assert_eq!(ensured.pages.len(), 1);
        assert!(fx.blob.exists("doc-1/page-1").await.unwrap());

        // Page count was discovered and persisted.
        let document = fx.metadata.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(document.page_count, Some(1));
    }

    #[tokio::test]
    async fn repeated_calls_are_pure_reads() {
        let fx = fixture();
        register(&fx, "doc-1").await;

        let first = fx.coordinator.ensure_pages("doc-1").await.unwrap();
        let blob_puts = fx.blob.put_count();
        let metadata_writes = fx.metadata.write_count();

        let second = fx.coordinator.ensure_pages("doc-1").await.unwrap();
        assert_eq!(first.pages, second.pages);
        assert_eq!(fx.blob.put_count(), blob_puts);
        assert_eq!(fx.metadata.write_count(), metadata_writes);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let fx = fixture();
        register(&fx, "doc-1").await;

        let source_reads_before = fx.blob.get_count();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = fx.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_pages("doc-1").await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        // One source fetch means one conversion run.
        assert_eq!(fx.blob.get_count() - source_reads_before, 1);
        for outcome in &outcomes {
            assert_eq!(outcome.pages, outcomes[0].pages);
        }
    }

    #[tokio::test]
    async fn expired_cache_triggers_reconversion() {
        let fx = fixture();
        register(&fx, "doc-1").await;

        fx.coordinator.ensure_pages("doc-1").await.unwrap();
        let puts_after_first = fx.blob.put_count();

        // Force every record past its deadline.
        let pages = fx.metadata.find_pages("doc-1").await.unwrap();
        for mut record in pages {
            record.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
            fx.metadata.upsert_page(&record).await.unwrap();
        }

        let ensured = fx.coordinator.ensure_pages("doc-1").await.unwrap();
        assert!(ensured.is_complete());
        assert!(fx.blob.put_count() > puts_after_first);
    }

    #[tokio::test]
    async fn ensure_page_hit_skips_the_job() {
        let fx = fixture();
        register(&fx, "doc-1").await;
        fx.coordinator.ensure_pages("doc-1").await.unwrap();

        let source_reads = fx.blob.get_count();
        let record = fx.coordinator.ensure_page("doc-1", 1).await.unwrap();
        assert_eq!(record.page_number, 1);
        assert_eq!(fx.blob.get_count(), source_reads);
    }

    #[tokio::test]
    async fn ensure_page_out_of_range_is_an_error() {
        let fx = fixture();
        register(&fx, "doc-1").await;

        let err = fx.coordinator.ensure_page("doc-1", 99).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::PageOutOfRange { page: 99, .. }
        ));

        let err = fx.coordinator.ensure_page("doc-1", 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::PageOutOfRange { page: 0, .. }));
    }

    #[test]
    fn contiguity_check_spots_gaps() {
        let now = chrono::Utc::now();
        let record = |page_number: u32| PageRecord {
            document_id: "doc-1".to_string(),
            page_number,
            blob_key: format!("doc-1/page-{page_number}"),
            byte_size: 1,
            width: 0,
            height: 0,
            sha256: String::new(),
            created_at: now,
            expires_at: now,
        };

        assert!(is_contiguous(&[record(1), record(2), record(3)]));
        assert!(!is_contiguous(&[record(1), record(3)]));
        assert!(!is_contiguous(&[record(2), record(3)]));
        assert!(is_contiguous(&[]));
    }
}
