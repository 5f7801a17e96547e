//! The recovery engine: ordered strategy tables per fault kind.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::access::AccessGate;
use crate::cache::PageCache;
use crate::config::RecoveryConfig;
use crate::convert::PageConverter;
use crate::db::MetadataStore;
use crate::document::PageRecord;
use crate::error::ServiceError;
use crate::storage::{keys, BlobStore};

use super::classifier::ErrorKind;
use super::types::{ErrorContext, Recovered, RecoveryResult, RecoveryStrategy};

/// The ordered strategy table for a fault kind. An empty table means
/// the kind is immediately fatal.
pub fn strategies_for(kind: ErrorKind) -> &'static [RecoveryStrategy] {
    use RecoveryStrategy::*;

    match kind {
        ErrorKind::UrlInvalid | ErrorKind::UrlExpired => {
            &[RegenerateSignedUrl, ProbeAlternatePath, ReconvertPage]
        }
        ErrorKind::ConversionFailed => &[RelaxedReencode, ServeCachedCopy, PlaceholderPage],
        ErrorKind::DatabaseError => &[RetryQuery, RebuildFromBlobs, BackupMetadata],
        ErrorKind::StorageNotFound | ErrorKind::StorageAccessDenied => {
            &[AlternateBucket, RegenerateFromSource, CdnFallback]
        }
        ErrorKind::NetworkTimeout => &[GenericRetry, ServeCachedCopy],
        ErrorKind::CacheCorrupted => &[ReconvertPage, PlaceholderPage],
        // Authorization is external fact; retrying cannot change it.
        ErrorKind::PermissionDenied => &[],
        ErrorKind::Unknown => &[GenericRetry],
    }
}

/// Walks strategy tables against the live stores.
///
/// The engine holds the same collaborators the pipeline does, plus
/// optional extras (alternate buckets, a backup metadata store, a CDN
/// mirror) that only recovery ever touches.
pub struct RecoveryEngine {
    blob: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: PageCache,
    converter: Arc<PageConverter>,
    gate: AccessGate,
    alternates: Vec<Arc<dyn BlobStore>>,
    backup_metadata: Option<Arc<dyn MetadataStore>>,
    http: reqwest::Client,
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        cache: PageCache,
        converter: Arc<PageConverter>,
        gate: AccessGate,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            blob,
            metadata,
            cache,
            converter,
            gate,
            alternates: Vec::new(),
            backup_metadata: None,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Additional buckets probed by `AlternateBucket` and
    /// `ProbeAlternatePath`, in preference order.
    pub fn with_alternates(mut self, alternates: Vec<Arc<dyn BlobStore>>) -> Self {
        self.alternates = alternates;
        self
    }

    /// Read-only metadata replica consulted by `BackupMetadata`.
    pub fn with_backup_metadata(mut self, backup: Arc<dyn MetadataStore>) -> Self {
        self.backup_metadata = Some(backup);
        self
    }

    /// Run the strategy table for `kind`, stopping at the first
    /// success. Attempts are capped by the configured budget minus
    /// whatever the context says was already spent, and each attempt
    /// runs under its own timeout so a slow strategy cannot starve the
    /// rest of the table.
    pub async fn handle(&self, kind: ErrorKind, ctx: &ErrorContext) -> RecoveryResult {
        let table = strategies_for(kind);
        let budget = self.config.max_attempts.saturating_sub(ctx.prior_attempts);

        if table.is_empty() || budget == 0 {
            info!(
                document_id = %ctx.document_id,
                page_number = ctx.page_number,
                kind = kind.as_str(),
                "fault is not recoverable"
            );
            return RecoveryResult::failed(0);
        }

        let mut attempts = 0;
        for strategy in table.iter().take(budget as usize) {
            attempts += 1;
            debug!(
                document_id = %ctx.document_id,
                page_number = ctx.page_number,
                kind = kind.as_str(),
                strategy = strategy.as_str(),
                attempt = attempts,
                "trying recovery strategy"
            );

            match timeout(self.config.strategy_timeout(), self.attempt(*strategy, ctx)).await {
                Ok(Ok(recovered)) => {
                    info!(
                        document_id = %ctx.document_id,
                        page_number = ctx.page_number,
                        kind = kind.as_str(),
                        strategy = strategy.as_str(),
                        attempts,
                        "recovered"
                    );
                    return RecoveryResult::recovered(*strategy, attempts, recovered);
                }
                Ok(Err(err)) => {
                    warn!(
                        document_id = %ctx.document_id,
                        page_number = ctx.page_number,
                        strategy = strategy.as_str(),
                        error = %err,
                        "recovery strategy failed"
                    );
                }
                Err(_) => {
                    warn!(
                        document_id = %ctx.document_id,
                        page_number = ctx.page_number,
                        strategy = strategy.as_str(),
                        "recovery strategy timed out"
                    );
                }
            }
        }

        warn!(
            document_id = %ctx.document_id,
            page_number = ctx.page_number,
            kind = kind.as_str(),
            attempts,
            fault = %ctx.fault,
            "recovery exhausted"
        );
        RecoveryResult::failed(attempts)
    }

    async fn attempt(
        &self,
        strategy: RecoveryStrategy,
        ctx: &ErrorContext,
    ) -> Result<Recovered, ServiceError> {
        match strategy {
            RecoveryStrategy::RegenerateSignedUrl => self.regenerate_signed_url(ctx).await,
            RecoveryStrategy::ProbeAlternatePath => self.probe_alternate_path(ctx).await,
            RecoveryStrategy::ReconvertPage => {
                self.regenerate(ctx, self.converter.config().render_options())
                    .await
            }
            RecoveryStrategy::RelaxedReencode => {
                self.regenerate(ctx, self.converter.config().relaxed_options())
                    .await
            }
            RecoveryStrategy::ServeCachedCopy => self.serve_cached_copy(ctx).await,
            RecoveryStrategy::PlaceholderPage => self.placeholder_page(ctx).await,
            RecoveryStrategy::RetryQuery => self.retry_query(ctx).await,
            RecoveryStrategy::RebuildFromBlobs => self.rebuild_from_blobs(ctx).await,
            RecoveryStrategy::BackupMetadata => self.backup_metadata(ctx).await,
            RecoveryStrategy::AlternateBucket => self.alternate_bucket(ctx).await,
            RecoveryStrategy::RegenerateFromSource => {
                self.regenerate(ctx, self.converter.config().render_options())
                    .await
            }
            RecoveryStrategy::CdnFallback => self.cdn_fallback(ctx).await,
            RecoveryStrategy::GenericRetry => self.generic_retry(ctx).await,
        }
    }

    /// Original source bytes of the document, for regeneration paths.
    async fn source_bytes(&self, document_id: &str) -> Result<Vec<u8>, ServiceError> {
        let source_key = match self.metadata.get_document(document_id).await {
            Ok(Some(document)) => document.source_key,
            // No row or a broken store; the conventional key still works.
            Ok(None) | Err(_) => keys::source_key(document_id),
        };
        Ok(self.blob.get(&source_key).await?)
    }

    /// Sign the cached record's blob key afresh.
    async fn regenerate_signed_url(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let record = self
            .cache
            .get(&ctx.document_id, ctx.page_number)
            .await?
            .ok_or_else(|| {
                ServiceError::DocumentNotFound(format!(
                    "{} page {} not cached",
                    ctx.document_id, ctx.page_number
                ))
            })?;

        let url = self.gate.sign_key(&record.blob_key, ctx.role).await?;
        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Probe the legacy key layout on the primary store and the current
    /// layout on the alternates. A hit rewrites the cached record so
    /// future reads go straight to the found key.
    async fn probe_alternate_path(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let current = keys::page_key(&ctx.document_id, ctx.page_number);
        let legacy = keys::legacy_page_key(&ctx.document_id, ctx.page_number);

        let mut candidates: Vec<(&Arc<dyn BlobStore>, &str)> = vec![(&self.blob, &legacy)];
        for alternate in &self.alternates {
            candidates.push((alternate, &current));
            candidates.push((alternate, &legacy));
        }

        for (store, key) in candidates {
            if store.exists(key).await.unwrap_or(false) {
                let url = self.sign_via(store, key, ctx).await?;
                let record = self.repoint_record(ctx, key).await;
                return Ok(Recovered { record, url: Some(url) });
            }
        }

        Err(ServiceError::Storage(crate::storage::StorageError::NotFound(
            current,
        )))
    }

    /// Re-render the page from source and write it through the cache.
    async fn regenerate(
        &self,
        ctx: &ErrorContext,
        options: crate::convert::RenderOptions,
    ) -> Result<Recovered, ServiceError> {
        let source = self.source_bytes(&ctx.document_id).await?;
        let record = self
            .converter
            .convert_page(&ctx.document_id, &source, ctx.page_number, &options)
            .await?;
        let record = self.cache.put(record).await?;
        let url = self.gate.sign_key(&record.blob_key, ctx.role).await?;

        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Serve the cached record if its blob still exists.
    async fn serve_cached_copy(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let record = self
            .cache
            .get(&ctx.document_id, ctx.page_number)
            .await?
            .ok_or_else(|| {
                ServiceError::DocumentNotFound(format!(
                    "{} page {} not cached",
                    ctx.document_id, ctx.page_number
                ))
            })?;

        let url = self.gate.resolve_page_url(&record, ctx.role).await?;
        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Publish a flat placeholder image. The placeholder is never
    /// recorded in the cache, so the next request retries for real.
    async fn placeholder_page(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let key = self
            .converter
            .publish_placeholder(&ctx.document_id, ctx.page_number)
            .await?;
        let url = self.gate.sign_key(&key, ctx.role).await?;

        Ok(Recovered {
            record: None,
            url: Some(url),
        })
    }

    /// Re-run the metadata read that failed.
    async fn retry_query(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let record = self
            .metadata
            .get_page(&ctx.document_id, ctx.page_number)
            .await?
            .filter(|record| !record.is_expired())
            .ok_or_else(|| {
                ServiceError::DocumentNotFound(format!(
                    "{} page {} not in metadata",
                    ctx.document_id, ctx.page_number
                ))
            })?;

        let url = self.gate.sign_key(&record.blob_key, ctx.role).await?;
        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Reconstruct the record by listing the blob store directly. The
    /// rebuilt record has no dimensions or checksum, but it addresses a
    /// real object. The cache write is best effort; if the metadata
    /// store is still down we serve the URL anyway.
    async fn rebuild_from_blobs(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let listing = self
            .blob
            .list(&keys::document_prefix(&ctx.document_id))
            .await?;

        let object = listing
            .iter()
            .find(|object| {
                keys::parse_page_key(&ctx.document_id, &object.key) == Some(ctx.page_number)
            })
            .ok_or_else(|| {
                ServiceError::Storage(crate::storage::StorageError::NotFound(keys::page_key(
                    &ctx.document_id,
                    ctx.page_number,
                )))
            })?;

        let now = chrono::Utc::now();
        let record = PageRecord {
            document_id: ctx.document_id.clone(),
            page_number: ctx.page_number,
            blob_key: object.key.clone(),
            byte_size: object.size.max(0) as u64,
            width: 0,
            height: 0,
            sha256: String::new(),
            created_at: now,
            expires_at: now,
        };

        let record = match self.cache.put(record.clone()).await {
            Ok(stamped) => stamped,
            Err(err) => {
                warn!(
                    document_id = %ctx.document_id,
                    page_number = ctx.page_number,
                    error = %err,
                    "rebuilt record could not be cached"
                );
                record
            }
        };

        let url = self.gate.sign_key(&record.blob_key, ctx.role).await?;
        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Read the record from the backup metadata store, if configured.
    async fn backup_metadata(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let backup = self.backup_metadata.as_ref().ok_or_else(|| {
            ServiceError::DocumentNotFound("no backup metadata store configured".to_string())
        })?;

        let record = backup
            .get_page(&ctx.document_id, ctx.page_number)
            .await?
            .filter(|record| !record.is_expired())
            .ok_or_else(|| {
                ServiceError::DocumentNotFound(format!(
                    "{} page {} not in backup metadata",
                    ctx.document_id, ctx.page_number
                ))
            })?;

        let url = self.gate.sign_key(&record.blob_key, ctx.role).await?;
        Ok(Recovered {
            record: Some(record),
            url: Some(url),
        })
    }

    /// Look for the page image in the alternate buckets.
    async fn alternate_bucket(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let key = keys::page_key(&ctx.document_id, ctx.page_number);

        for alternate in &self.alternates {
            if alternate.exists(&key).await.unwrap_or(false) {
                let url = self.sign_via(alternate, &key, ctx).await?;
                return Ok(Recovered {
                    record: None,
                    url: Some(url),
                });
            }
        }

        Err(ServiceError::Storage(crate::storage::StorageError::NotFound(
            key,
        )))
    }

    /// Probe the CDN mirror for a cached copy of the page image.
    async fn cdn_fallback(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        let base = self.config.cdn_base_url.as_deref().ok_or_else(|| {
            ServiceError::DocumentNotFound("no CDN mirror configured".to_string())
        })?;

        let key = keys::page_key(&ctx.document_id, ctx.page_number);
        let url = format!("{}/{}", base.trim_end_matches('/'), key);

        let response = self.http.head(&url).send().await.map_err(|err| {
            ServiceError::Storage(crate::storage::StorageError::Timeout(err.to_string()))
        })?;
        if !response.status().is_success() {
            return Err(ServiceError::Storage(
                crate::storage::StorageError::NotFound(url),
            ));
        }

        let ttl = self.gate.url_ttl(ctx.role);
        Ok(Recovered {
            record: None,
            url: Some(crate::access::PageUrl {
                url,
                expires_at: chrono::Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64),
                watermark: self.gate.watermark(ctx.role),
            }),
        })
    }

    /// Re-run the primary read path once, for transient faults.
    async fn generic_retry(&self, ctx: &ErrorContext) -> Result<Recovered, ServiceError> {
        self.serve_cached_copy(ctx).await
    }

    /// Sign a key through an arbitrary store with the role's TTL.
    async fn sign_via(
        &self,
        store: &Arc<dyn BlobStore>,
        key: &str,
        ctx: &ErrorContext,
    ) -> Result<crate::access::PageUrl, ServiceError> {
        let ttl = self.gate.url_ttl(ctx.role);
        let url = store.signed_url(key, ttl).await?;
        Ok(crate::access::PageUrl {
            url,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64),
            watermark: self.gate.watermark(ctx.role),
        })
    }

    /// Point the cached record at `key` after a successful probe.
    async fn repoint_record(&self, ctx: &ErrorContext, key: &str) -> Option<PageRecord> {
        let mut record = self
            .cache
            .get(&ctx.document_id, ctx.page_number)
            .await
            .ok()
            .flatten()?;
        record.blob_key = key.to_string();
        self.cache.put(record).await.ok()
    }
}
