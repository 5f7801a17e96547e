//! Document-to-pages conversion over a blob store.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConvertConfig;
use crate::document::PageRecord;
use crate::storage::{keys, BlobStore};

use super::renderer::SafeRenderer;
use super::types::{ConversionReport, FailedPage, ImageFormat, RenderOptions, RenderedPage};
use super::ConvertError;

/// Converts documents and single pages into uploaded page images.
pub struct PageConverter {
    blob: Arc<dyn BlobStore>,
    config: ConvertConfig,
    /// Parsed documents kept warm for page-level re-renders.
    renderers: Mutex<LruCache<String, Arc<SafeRenderer>>>,
}

impl PageConverter {
    pub fn new(blob: Arc<dyn BlobStore>, config: ConvertConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.renderer_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            blob,
            config,
            renderers: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Get or build the renderer for a document. A cold build parses
    /// the PDF outside the lock; racing tasks may both parse, last
    /// insert wins.
    fn renderer_for(
        &self,
        document_id: &str,
        source: &[u8],
    ) -> Result<Arc<SafeRenderer>, ConvertError> {
        if let Some(renderer) = self.renderers.lock().get(document_id) {
            return Ok(renderer.clone());
        }

        let renderer = Arc::new(SafeRenderer::from_bytes(source.to_vec())?);
        self.renderers
            .lock()
            .put(document_id.to_string(), renderer.clone());
        Ok(renderer)
    }

    /// Drop the cached renderer, e.g. after the source was replaced.
    pub fn evict_renderer(&self, document_id: &str) {
        self.renderers.lock().pop(document_id);
    }

    /// Rasterize one page on a blocking thread under the render
    /// deadline.
    async fn render_offloaded(
        &self,
        renderer: Arc<SafeRenderer>,
        page_number: u32,
        options: RenderOptions,
    ) -> Result<RenderedPage, ConvertError> {
        let timeout_secs = self.config.render_timeout_secs;
        let render = tokio::task::spawn_blocking(move || {
            renderer.render_page(page_number, &options)
        });

        match timeout(self.config.render_timeout(), render).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ConvertError::Join(join_err.to_string())),
            Err(_) => Err(ConvertError::Timeout(timeout_secs)),
        }
    }

    /// Upload a rendered page at its canonical key and build its
    /// record. The record carries a zero TTL until the cache stamps it.
    async fn upload_page(
        &self,
        document_id: &str,
        rendered: RenderedPage,
    ) -> Result<PageRecord, ConvertError> {
        let blob_key = keys::page_key(document_id, rendered.page_number);
        let sha256 = hex::encode(Sha256::digest(&rendered.bytes));
        let byte_size = rendered.bytes.len() as u64;

        self.blob
            .put(&blob_key, rendered.bytes, rendered.format.content_type())
            .await?;

        let now = Utc::now();
        Ok(PageRecord {
            document_id: document_id.to_string(),
            page_number: rendered.page_number,
            blob_key,
            byte_size,
            width: rendered.width,
            height: rendered.height,
            sha256,
            created_at: now,
            expires_at: now,
        })
    }

    /// Convert a single page with explicit render options.
    pub async fn convert_page(
        &self,
        document_id: &str,
        source: &[u8],
        page_number: u32,
        options: &RenderOptions,
    ) -> Result<PageRecord, ConvertError> {
        let renderer = self.renderer_for(document_id, source)?;
        let rendered = self
            .render_offloaded(renderer, page_number, *options)
            .await?;

        debug!(
            document_id,
            page_number,
            bytes = rendered.bytes.len(),
            "page rendered"
        );
        self.upload_page(document_id, rendered).await
    }

    /// Convert every page of a document with the configured options.
    ///
    /// Pages are rendered and uploaded with bounded concurrency; a page
    /// that fails lands in the report's `failures` instead of aborting
    /// the run. Only opening the document itself is fatal.
    pub async fn convert_document(
        &self,
        document_id: &str,
        source: &[u8],
    ) -> Result<ConversionReport, ConvertError> {
        let renderer = self.renderer_for(document_id, source)?;
        let total_pages = renderer.page_count();
        let options = self.config.render_options();

        info!(document_id, total_pages, "starting document conversion");

        let outcomes: Vec<(u32, Result<PageRecord, ConvertError>)> =
            stream::iter(1..=total_pages)
                .map(|page_number| {
                    let renderer = renderer.clone();
                    async move {
                        let outcome = match self
                            .render_offloaded(renderer, page_number, options)
                            .await
                        {
                            Ok(rendered) => self.upload_page(document_id, rendered).await,
                            Err(err) => Err(err),
                        };
                        (page_number, outcome)
                    }
                })
                .buffer_unordered(self.config.max_parallel_renders.max(1))
                .collect()
                .await;

        let mut records = Vec::with_capacity(total_pages as usize);
        let mut failures = Vec::new();
        for (page_number, outcome) in outcomes {
            match outcome {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(document_id, page_number, error = %error, "page conversion failed");
                    failures.push(FailedPage { page_number, error });
                }
            }
        }

        records.sort_by_key(|record| record.page_number);
        failures.sort_by_key(|failure| failure.page_number);

        info!(
            document_id,
            converted = records.len(),
            failed = failures.len(),
            "document conversion finished"
        );

        Ok(ConversionReport {
            document_id: document_id.to_string(),
            total_pages,
            records,
            failures,
        })
    }

    /// Render and upload a thumbnail. Thumbnails live at their own key
    /// and are not tracked in the metadata store.
    pub async fn convert_thumbnail(
        &self,
        document_id: &str,
        source: &[u8],
        page_number: u32,
    ) -> Result<String, ConvertError> {
        let renderer = self.renderer_for(document_id, source)?;
        let max_px = self.config.thumbnail_max_px;

        let timeout_secs = self.config.render_timeout_secs;
        let render = tokio::task::spawn_blocking(move || {
            renderer.render_thumbnail(page_number, max_px)
        });
        let rendered = match timeout(self.config.render_timeout(), render).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(ConvertError::Join(join_err.to_string())),
            Err(_) => return Err(ConvertError::Timeout(timeout_secs)),
        };

        let key = keys::thumb_key(document_id, page_number);
        self.blob
            .put(&key, rendered.bytes, rendered.format.content_type())
            .await?;
        Ok(key)
    }

    /// Upload a flat placeholder image for a page that could not be
    /// produced. Returns the blob key; placeholders are never recorded
    /// in the metadata store.
    pub async fn publish_placeholder(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<String, ConvertError> {
        let scale = self.config.scale.clamp(0.1, 4.0);
        // US Letter at the configured scale.
        let width = (612.0 * scale) as u32;
        let height = (792.0 * scale) as u32;

        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([242, 243, 245, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .map_err(|err| ConvertError::Encode(err.to_string()))?;

        let key = keys::placeholder_key(document_id, page_number);
        self.blob
            .put(&key, bytes, ImageFormat::Png.content_type())
            .await?;
        Ok(key)
    }
}
