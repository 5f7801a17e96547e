//! End-to-end pipeline tests over the in-process backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use folio::db::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
use folio::storage::{BlobStore, MemoryBlobStore, ObjectMetadata, StorageError};
use folio::{Config, ErrorKind, PageService, PageState, Viewer, ViewerRole};

/// Build a well-formed PDF with `count` blank US Letter pages,
/// computing real xref offsets so strict parsers accept it.
fn pdf_with_pages(count: u32) -> Vec<u8> {
    let mut body = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();

    let mut append = |body: &mut Vec<u8>, offsets: &mut Vec<usize>, id: u32, content: &str| {
        offsets.push(body.len());
        body.extend_from_slice(format!("{id} 0 obj\n{content}\nendobj\n").as_bytes());
    };

    let kids: Vec<String> = (0..count).map(|i| format!("{} 0 R", 3 + i)).collect();
    append(
        &mut body,
        &mut offsets,
        1,
        "<< /Type /Catalog /Pages 2 0 R >>",
    );
    append(
        &mut body,
        &mut offsets,
        2,
        &format!("<< /Type /Pages /Kids [{}] /Count {count} >>", kids.join(" ")),
    );
    for i in 0..count {
        append(
            &mut body,
            &mut offsets,
            3 + i,
            &format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << >> >>",
                3 + count + i
            ),
        );
    }
    for i in 0..count {
        append(
            &mut body,
            &mut offsets,
            3 + count + i,
            "<< /Length 0 >>\nstream\nendstream",
        );
    }

    let xref_offset = body.len();
    let total = offsets.len() + 1;
    body.extend_from_slice(format!("xref\n0 {total}\n").as_bytes());
    body.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        body.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    body.extend_from_slice(
        format!("trailer\n<< /Size {total} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF")
            .as_bytes(),
    );
    body
}

struct Harness {
    blob: MemoryBlobStore,
    metadata: MemoryMetadataStore,
    service: PageService,
}

fn harness() -> Harness {
    let blob = MemoryBlobStore::new();
    let metadata = MemoryMetadataStore::new();
    let service = PageService::new(
        Config::default(),
        Arc::new(blob.clone()),
        Arc::new(metadata.clone()),
        Arc::new(folio::access::AllowAll),
    );
    Harness {
        blob,
        metadata,
        service,
    }
}

/// Blob store that refuses writes to one key; everything else passes
/// through to the wrapped memory store.
struct RejectingPut {
    inner: MemoryBlobStore,
    rejected: String,
}

#[async_trait]
impl BlobStore for RejectingPut {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if key == self.rejected {
            return Err(StorageError::AccessDenied(key.to_string()));
        }
        self.inner.put(key, bytes, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.inner.signed_url(key, ttl).await
    }
}

/// Poll the session snapshot until `page` reaches `state` or the
/// deadline passes. Preloads run on background tasks.
async fn wait_for_state(
    service: &PageService,
    session_id: uuid::Uuid,
    page: u32,
    state: PageState,
) {
    for _ in 0..250 {
        let info = service.session_snapshot(session_id).await.unwrap();
        if info.state_of(page) == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let info = service.session_snapshot(session_id).await.unwrap();
    panic!(
        "page {page} never reached {state:?}; last seen {:?}",
        info.state_of(page)
    );
}

#[tokio::test]
async fn repeated_requests_are_idempotent() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(3))
        .await
        .unwrap();

    let first = h.service.ensure_pages("doc-1").await.unwrap();
    assert!(first.is_complete());
    assert_eq!(first.pages.len(), 3);

    let puts = h.blob.put_count();
    let writes = h.metadata.write_count();

    let second = h.service.ensure_pages("doc-1").await.unwrap();
    assert_eq!(first.pages, second.pages);
    assert_eq!(h.blob.put_count(), puts);
    assert_eq!(h.metadata.write_count(), writes);
}

#[tokio::test]
async fn concurrent_viewers_share_one_conversion() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(2))
        .await
        .unwrap();

    let source_reads = h.blob.get_count();
    let mut handles = Vec::new();
    for i in 0..10 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            let viewer = Viewer::new(format!("u-{i}"), ViewerRole::Member);
            service.get_page("doc-1", 1, &viewer).await
        }));
    }

    for handle in handles {
        let url = handle.await.unwrap().unwrap();
        assert!(h.blob.verify_url(&url.url));
    }

    // One source fetch means exactly one conversion ran.
    assert_eq!(h.blob.get_count() - source_reads, 1);
}

#[tokio::test]
async fn pages_come_back_contiguous() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(5))
        .await
        .unwrap();

    let ensured = h.service.ensure_pages("doc-1").await.unwrap();
    assert!(ensured.is_complete());
    let numbers: Vec<u32> = ensured.pages.iter().map(|r| r.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    for record in &ensured.pages {
        assert!(h.blob.exists(&record.blob_key).await.unwrap());
        assert!(!record.sha256.is_empty());
    }
}

#[tokio::test]
async fn failed_page_does_not_abort_its_siblings() {
    let inner = MemoryBlobStore::new();
    let metadata = MemoryMetadataStore::new();
    let service = PageService::new(
        Config::default(),
        Arc::new(RejectingPut {
            inner: inner.clone(),
            rejected: "doc-1/page-2".to_string(),
        }),
        Arc::new(metadata.clone()),
        Arc::new(folio::access::AllowAll),
    );

    service
        .register_document("doc-1", "Report", pdf_with_pages(3))
        .await
        .unwrap();

    // Page 2 can never be uploaded; pages 1 and 3 convert anyway.
    let ensured = service.ensure_pages("doc-1").await.unwrap();
    assert!(!ensured.is_complete());

    let numbers: Vec<u32> = ensured.pages.iter().map(|r| r.page_number).collect();
    assert_eq!(numbers, vec![1, 3]);

    assert_eq!(ensured.failures.len(), 1);
    let failure = &ensured.failures[0];
    assert_eq!(failure.page_number, 2);
    assert_eq!(failure.kind, ErrorKind::StorageAccessDenied);
    assert_eq!(failure.attempts, 3);
    assert!(!failure.message.contains("doc-1"));
    assert!(!failure.affordances.is_empty());

    // The siblings were uploaded and cached; the failed page was not.
    assert!(inner.exists("doc-1/page-1").await.unwrap());
    assert!(!inner.exists("doc-1/page-2").await.unwrap());
    assert!(inner.exists("doc-1/page-3").await.unwrap());
    let cached: Vec<u32> = metadata
        .find_pages("doc-1")
        .await
        .unwrap()
        .iter()
        .map(|r| r.page_number)
        .collect();
    assert_eq!(cached, vec![1, 3]);
}

#[tokio::test]
async fn expired_records_trigger_reconversion() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(2))
        .await
        .unwrap();
    h.service.ensure_pages("doc-1").await.unwrap();
    let puts = h.blob.put_count();

    // Push every record past its freshness deadline.
    for mut record in h.metadata.find_pages("doc-1").await.unwrap() {
        record.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        h.metadata.upsert_page(&record).await.unwrap();
    }

    let ensured = h.service.ensure_pages("doc-1").await.unwrap();
    assert!(ensured.is_complete());
    assert!(h.blob.put_count() > puts);
    for record in &ensured.pages {
        assert!(!record.is_expired());
    }
}

#[tokio::test]
async fn failures_are_sanitized_and_bounded() {
    let h = harness();

    let viewer = Viewer::new("u-1", ViewerRole::Member);
    let failure = h
        .service
        .get_page("never-registered", 1, &viewer)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, ErrorKind::Unknown);
    assert!(failure.attempts <= 3);
    assert!(!failure.message.contains("never-registered"));
    assert!(!failure.affordances.is_empty());
}

#[tokio::test]
async fn vanished_page_blob_is_regenerated_from_source() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(2))
        .await
        .unwrap();
    h.service.ensure_pages("doc-1").await.unwrap();

    // Lose the rendered image but keep the source and the record.
    h.blob.delete("doc-1/page-2").await.unwrap();
    assert!(!h.blob.exists("doc-1/page-2").await.unwrap());

    let viewer = Viewer::new("u-1", ViewerRole::Owner);
    let url = h.service.get_page("doc-1", 2, &viewer).await.unwrap();
    assert!(h.blob.verify_url(&url.url));
    assert!(h.blob.exists("doc-1/page-2").await.unwrap());
}

#[tokio::test]
async fn sessions_are_isolated_per_viewer() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(5))
        .await
        .unwrap();

    let a = h
        .service
        .open_session("doc-1", Viewer::new("alice", ViewerRole::Member), 1)
        .await
        .unwrap();
    let b = h
        .service
        .open_session("doc-1", Viewer::new("bo", ViewerRole::Member), 4)
        .await
        .unwrap();

    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.current_page, 1);
    assert_eq!(b.current_page, 4);

    h.service.navigate(a.session_id, 3).await.unwrap();
    let b_after = h.service.session_snapshot(b.session_id).await.unwrap();
    assert_eq!(b_after.current_page, 4);

    // Closing one session leaves the other fully usable.
    assert!(h.service.close_session(a.session_id).await);
    let view = h.service.navigate(b.session_id, 5).await.unwrap();
    assert_eq!(view.state, PageState::Loaded);
}

#[tokio::test]
async fn near_simultaneous_sessions_share_the_conversion() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(3))
        .await
        .unwrap();

    let source_reads = h.blob.get_count();

    let service = h.service.clone();
    let first = tokio::spawn(async move {
        service
            .open_session("doc-1", Viewer::new("alice", ViewerRole::Member), 1)
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let service = h.service.clone();
    let second = tokio::spawn(async move {
        service
            .open_session("doc-1", Viewer::new("bo", ViewerRole::Member), 1)
            .await
    });

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_eq!(a.total_pages, 3);
    assert_eq!(b.total_pages, 3);
    assert_eq!(h.blob.get_count() - source_reads, 1);
}

#[tokio::test]
async fn preload_window_fills_around_the_current_page() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(6))
        .await
        .unwrap();

    let info = h
        .service
        .open_session("doc-1", Viewer::new("u-1", ViewerRole::Member), 3)
        .await
        .unwrap();
    assert_eq!(info.state_of(3), PageState::Loaded);

    // Default window is two pages on each side.
    for page in [1, 2, 4, 5] {
        wait_for_state(&h.service, info.session_id, page, PageState::Loaded).await;
    }
    let info = h.service.session_snapshot(info.session_id).await.unwrap();
    assert_eq!(info.state_of(6), PageState::Unloaded);
}

#[tokio::test]
async fn navigation_recenters_the_preload_window() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(6))
        .await
        .unwrap();

    let info = h
        .service
        .open_session("doc-1", Viewer::new("u-1", ViewerRole::Member), 1)
        .await
        .unwrap();

    let view = h.service.navigate(info.session_id, 5).await.unwrap();
    assert_eq!(view.state, PageState::Loaded);
    wait_for_state(&h.service, info.session_id, 6, PageState::Loaded).await;
}

#[tokio::test]
async fn role_shapes_url_lifetime_and_watermark() {
    let h = harness();
    h.service
        .register_document("doc-1", "Report", pdf_with_pages(1))
        .await
        .unwrap();

    let anonymous = h
        .service
        .get_page("doc-1", 1, &Viewer::anonymous())
        .await
        .unwrap();
    let owner = h
        .service
        .get_page("doc-1", 1, &Viewer::new("u-1", ViewerRole::Owner))
        .await
        .unwrap();

    assert!(anonymous.watermark);
    assert!(!owner.watermark);
    assert!(anonymous.expires_at < owner.expires_at);
}

#[tokio::test]
async fn sqlite_backend_persists_pages_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("folio.db").display());

    let blob = MemoryBlobStore::new();
    let metadata = SqliteMetadataStore::connect(&url).await.unwrap();
    let service = PageService::new(
        Config::default(),
        Arc::new(blob.clone()),
        Arc::new(metadata),
        Arc::new(folio::access::AllowAll),
    );

    service
        .register_document("doc-1", "Report", pdf_with_pages(2))
        .await
        .unwrap();
    let ensured = service.ensure_pages("doc-1").await.unwrap();
    assert!(ensured.is_complete());

    // A second store over the same file sees the committed run.
    let reopened = SqliteMetadataStore::connect(&url).await.unwrap();
    let document = reopened.get_document("doc-1").await.unwrap().unwrap();
    assert_eq!(document.page_count, Some(2));
    assert_eq!(reopened.find_pages("doc-1").await.unwrap().len(), 2);
}
