//! The service facade: wiring and the public API.
//!
//! [`PageService`] owns every subsystem and is what request handlers
//! hold. Construction wires stores, cache, converter, recovery engine,
//! coordinator, and session manager together; the methods below are
//! the whole surface callers see.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{AccessGate, AllowAll, AuthorizationOracle, PageUrl, Viewer};
use crate::cache::PageCache;
use crate::config::Config;
use crate::convert::PageConverter;
use crate::db::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
use crate::document::DocumentRecord;
use crate::error::{Result, ServiceError};
use crate::pipeline::{ConversionCoordinator, EnsuredPages, JobRegistry};
use crate::recovery::{classify, ErrorContext, PageFailure, RecoveryEngine, ViewSurface};
use crate::session::{PageView, SessionInfo, SessionManager};
use crate::storage::{keys, BlobStore, MemoryBlobStore, S3BlobStore};

struct ServiceInner {
    blob: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: PageCache,
    converter: Arc<PageConverter>,
    gate: AccessGate,
    engine: Arc<RecoveryEngine>,
    coordinator: Arc<ConversionCoordinator>,
    sessions: SessionManager,
}

/// The page conversion and caching service.
#[derive(Clone)]
pub struct PageService {
    inner: Arc<ServiceInner>,
}

/// Operational counters for health endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub active_sessions: usize,
    pub in_flight_jobs: usize,
}

/// Handles on the background maintenance loops.
pub struct MaintenanceTasks {
    pub sweeper: JoinHandle<()>,
    pub session_cleanup: JoinHandle<()>,
}

impl MaintenanceTasks {
    pub fn abort(&self) {
        self.sweeper.abort();
        self.session_cleanup.abort();
    }
}

impl PageService {
    /// Wire the service over explicit backends.
    pub fn new(
        config: Config,
        blob: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        oracle: Arc<dyn AuthorizationOracle>,
    ) -> Self {
        let cache = PageCache::new(metadata.clone(), &config.cache);
        let converter = Arc::new(PageConverter::new(blob.clone(), config.convert.clone()));
        let gate = AccessGate::new(blob.clone(), oracle, config.access.clone());
        let engine = Arc::new(RecoveryEngine::new(
            blob.clone(),
            metadata.clone(),
            cache.clone(),
            converter.clone(),
            gate.clone(),
            config.recovery.clone(),
        ));
        let coordinator = Arc::new(ConversionCoordinator::new(
            blob.clone(),
            metadata.clone(),
            cache.clone(),
            converter.clone(),
            engine.clone(),
            JobRegistry::new(),
        ));
        let sessions = SessionManager::new(
            coordinator.clone(),
            gate.clone(),
            engine.clone(),
            config.session.clone(),
        );

        Self {
            inner: Arc::new(ServiceInner {
                blob,
                metadata,
                cache,
                converter,
                gate,
                engine,
                coordinator,
                sessions,
            }),
        }
    }

    /// Fully in-process service: memory stores, open authorization.
    /// For tests, benches, and embedded single-user deployments.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(AllowAll),
        )
    }

    /// Connect the production backends: an S3-compatible bucket and a
    /// SQLite metadata database.
    pub async fn connect(config: Config, oracle: Arc<dyn AuthorizationOracle>) -> Result<Self> {
        let blob = S3BlobStore::new(&config.storage).await;
        let metadata = SqliteMetadataStore::connect(&config.database.url).await?;
        Ok(Self::new(
            config,
            Arc::new(blob),
            Arc::new(metadata),
            oracle,
        ))
    }

    /// Register (or re-register) a source document. The source lands
    /// at its conventional key; any previously converted pages are
    /// invalidated so the next access reconverts against the new bytes.
    pub async fn register_document(
        &self,
        document_id: &str,
        title: &str,
        source: Vec<u8>,
    ) -> Result<DocumentRecord> {
        let source_key = keys::source_key(document_id);
        self.inner
            .blob
            .put(&source_key, source, "application/pdf")
            .await?;

        // A fresh record resets the page count: the new source may
        // have a different number of pages.
        let record = DocumentRecord::new(document_id, title, source_key);
        self.inner.metadata.upsert_document(&record).await?;

        self.inner.converter.evict_renderer(document_id);
        self.inner.cache.invalidate(document_id).await?;

        info!(document_id, title, "registered document");
        Ok(record)
    }

    /// Make every page of the document exist. See
    /// [`ConversionCoordinator::ensure_pages`].
    pub async fn ensure_pages(&self, document_id: &str) -> Result<EnsuredPages> {
        self.inner.coordinator.ensure_pages(document_id).await
    }

    /// Resolve one page to a signed URL for this viewer.
    ///
    /// Never leaks a raw internal fault: a failing load is classified,
    /// run through recovery, and, if recovery exhausts, returned as a
    /// sanitized per-page failure carrying retry/skip/report
    /// affordances.
    pub async fn get_page(
        &self,
        document_id: &str,
        page_number: u32,
        viewer: &Viewer,
    ) -> std::result::Result<PageUrl, PageFailure> {
        let error = match self.try_get_page(document_id, page_number, viewer).await {
            Ok(url) => return Ok(url),
            Err(error) => error,
        };

        // A failure that already went through recovery keeps its
        // verdict instead of re-entering the engine.
        if let ServiceError::Page(failure) = error {
            return Err(failure);
        }

        let kind = classify(&error);

        // An out-of-range page is a caller mistake, not a fault any
        // strategy can repair; fail it without spending the budget.
        if matches!(error, ServiceError::PageOutOfRange { .. }) {
            return Err(PageFailure::terminal(page_number, kind, 0));
        }

        warn!(
            document_id,
            page_number,
            kind = kind.as_str(),
            error = %error,
            "page request failed, attempting recovery"
        );

        let ctx = ErrorContext::new(
            document_id,
            page_number,
            viewer.role,
            ViewSurface::Api,
            error.to_string(),
        );
        let result = self.inner.engine.handle(kind, &ctx).await;

        if result.success {
            if let Some(url) = result.url {
                return Ok(url);
            }
            if let Some(record) = result.record {
                if let Ok(url) = self
                    .inner
                    .gate
                    .resolve_page_url(&record, viewer.role)
                    .await
                {
                    return Ok(url);
                }
            }
        }

        Err(PageFailure::terminal(page_number, kind, result.attempts))
    }

    async fn try_get_page(
        &self,
        document_id: &str,
        page_number: u32,
        viewer: &Viewer,
    ) -> Result<PageUrl> {
        self.inner.gate.authorize(document_id, viewer).await?;
        let record = self
            .inner
            .coordinator
            .ensure_page(document_id, page_number)
            .await?;
        Ok(self
            .inner
            .gate
            .resolve_page_url(&record, viewer.role)
            .await?)
    }

    /// Signed URL for a page thumbnail, rendered on first request.
    /// Thumbnails are blob-only; they have no cache records.
    pub async fn get_thumbnail(
        &self,
        document_id: &str,
        page_number: u32,
        viewer: &Viewer,
    ) -> Result<PageUrl> {
        self.inner.gate.authorize(document_id, viewer).await?;

        let thumb_key = keys::thumb_key(document_id, page_number);
        if !self.inner.blob.exists(&thumb_key).await? {
            let document = self
                .inner
                .metadata
                .get_document(document_id)
                .await?
                .ok_or_else(|| ServiceError::DocumentNotFound(document_id.to_string()))?;
            let source = self.inner.blob.get(&document.source_key).await?;
            self.inner
                .converter
                .convert_thumbnail(document_id, &source, page_number)
                .await?;
        }

        Ok(self.inner.gate.sign_key(&thumb_key, viewer.role).await?)
    }

    /// Open a viewing session: loads the start page inline and preloads
    /// the window around it.
    pub async fn open_session(
        &self,
        document_id: &str,
        viewer: Viewer,
        start_page: u32,
    ) -> Result<SessionInfo> {
        self.inner
            .sessions
            .open_session(document_id, viewer, start_page)
            .await
    }

    pub async fn navigate(&self, session_id: Uuid, page_number: u32) -> Result<PageView> {
        self.inner.sessions.navigate(session_id, page_number).await
    }

    pub async fn session_snapshot(&self, session_id: Uuid) -> Result<SessionInfo> {
        self.inner.sessions.snapshot(session_id).await
    }

    /// Never errors; closing an unknown session is a no-op.
    pub async fn close_session(&self, session_id: Uuid) -> bool {
        self.inner.sessions.close_session(session_id).await
    }

    /// Drop every cached page of a document; the next access
    /// reconverts. The source and the registration survive.
    pub async fn invalidate(&self, document_id: &str) -> Result<()> {
        self.inner.converter.evict_renderer(document_id);
        self.inner.cache.invalidate(document_id).await?;
        info!(document_id, "invalidated cached pages");
        Ok(())
    }

    /// Remove a document entirely: blobs, cache records, registration.
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let prefix = keys::document_prefix(document_id);
        for object in self.inner.blob.list(&prefix).await? {
            self.inner.blob.delete(&object.key).await?;
        }

        self.inner.converter.evict_renderer(document_id);
        self.inner.cache.invalidate(document_id).await?;
        self.inner.metadata.delete_document(document_id).await?;

        info!(document_id, "deleted document");
        Ok(())
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_sessions: self.inner.sessions.active_sessions().await,
            in_flight_jobs: self.inner.coordinator.registry().in_flight().await,
        }
    }

    /// Recovery extras (alternate buckets, a backup metadata store)
    /// only recovery ever touches; expose the engine so deployments can
    /// wire them in.
    pub fn recovery_engine(&self) -> &Arc<RecoveryEngine> {
        &self.inner.engine
    }

    /// Start the background loops: expired-record sweeping and idle
    /// session cleanup.
    pub fn spawn_maintenance(&self) -> MaintenanceTasks {
        MaintenanceTasks {
            sweeper: self.inner.cache.clone().start_sweeper(),
            session_cleanup: self.inner.sessions.start_cleanup_task(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ViewerRole;
    use crate::recovery::ErrorKind;

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

    #[tokio::test]
    async fn register_then_get_page() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();

        let viewer = Viewer::new("u-1", ViewerRole::Member);
        let url = service.get_page("doc-1", 1, &viewer).await.unwrap();
        assert!(!url.is_expired());
        assert!(!url.watermark);
    }

    #[tokio::test]
    async fn get_page_failures_are_sanitized() {
        let service = PageService::in_memory(Config::default());

        // Unregistered document: no strategy can help, and the failure
        // that comes back carries a kind and affordances, not store
        // internals.
        let viewer = Viewer::new("u-1", ViewerRole::Member);
        let failure = service.get_page("ghost", 1, &viewer).await.unwrap_err();
        assert_eq!(failure.page_number, 1);
        assert_eq!(failure.kind, ErrorKind::Unknown);
        assert!(!failure.message.is_empty());
        assert!(!failure.message.contains("ghost"));
    }

    #[tokio::test]
    async fn out_of_range_page_fails_without_spending_the_budget() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();

        // One-page document; page 9 is a caller mistake, so no
        // recovery strategies run.
        let viewer = Viewer::new("u-1", ViewerRole::Member);
        let failure = service.get_page("doc-1", 9, &viewer).await.unwrap_err();
        assert_eq!(failure.page_number, 9);
        assert_eq!(failure.attempts, 0);
        assert_eq!(failure.kind, ErrorKind::UrlInvalid);
    }

    #[tokio::test]
    async fn invalidate_forces_reconversion() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();

        let first = service.ensure_pages("doc-1").await.unwrap();
        service.invalidate("doc-1").await.unwrap();

        let second = service.ensure_pages("doc-1").await.unwrap();
        assert_eq!(second.pages.len(), first.pages.len());
        assert!(second.pages[0].created_at >= first.pages[0].created_at);
    }

    #[tokio::test]
    async fn delete_document_removes_everything() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();
        service.ensure_pages("doc-1").await.unwrap();

        service.delete_document("doc-1").await.unwrap();

        let err = service.ensure_pages("doc-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::DocumentNotFound(_)));
        assert!(!service.inner.blob.exists("doc-1/page-1").await.unwrap());
        assert!(!service.inner.blob.exists("doc-1/source.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn reregistering_resets_the_page_count() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "v1", minimal_pdf())
            .await
            .unwrap();
        service.ensure_pages("doc-1").await.unwrap();

        let record = service
            .register_document("doc-1", "v2", minimal_pdf())
            .await
            .unwrap();
        assert_eq!(record.title, "v2");
        assert_eq!(record.page_count, None);
    }

    #[tokio::test]
    async fn thumbnail_roundtrip() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();

        let viewer = Viewer::new("u-1", ViewerRole::Owner);
        let first = service.get_thumbnail("doc-1", 1, &viewer).await.unwrap();
        assert!(!first.is_expired());

        // Second request signs the existing blob without re-rendering.
        let second = service.get_thumbnail("doc-1", 1, &viewer).await.unwrap();
        assert!(!second.is_expired());
    }

    #[tokio::test]
    async fn stats_track_sessions() {
        let service = PageService::in_memory(Config::default());
        service
            .register_document("doc-1", "Report", minimal_pdf())
            .await
            .unwrap();

        let info = service
            .open_session("doc-1", Viewer::anonymous(), 1)
            .await
            .unwrap();
        assert_eq!(service.stats().await.active_sessions, 1);

        service.close_session(info.session_id).await;
        assert_eq!(service.stats().await.active_sessions, 0);
    }
}
