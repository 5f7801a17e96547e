//! Page conversion: rasterize, compress, upload.
//!
//! [`PageConverter`] turns source PDF bytes into per-page image blobs
//! plus the [`PageRecord`](crate::document::PageRecord)s describing
//! them. Rendering happens on blocking threads under a deadline;
//! open documents are kept warm in a small LRU so page-level
//! re-renders skip the parse.

mod converter;
mod renderer;
pub mod types;

use thiserror::Error;

pub use converter::PageConverter;
pub use renderer::{PdfRenderer, SafeRenderer};
pub use types::{ConversionReport, FailedPage, ImageFormat, RenderOptions, RenderedPage};

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("MuPDF error: {0}")]
    Mupdf(#[from] mupdf::Error),

    #[error("Document has no pages")]
    EmptyDocument,

    #[error("Page {page} out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    #[error("Image encoding failed: {0}")]
    Encode(String),

    #[error("Render timed out after {0}s")]
    Timeout(u64),

    #[error("Page upload failed: {0}")]
    Upload(#[from] StorageError),

    #[error("Render task failed: {0}")]
    Join(String),
}
