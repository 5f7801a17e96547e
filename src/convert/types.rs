//! Conversion request and result types

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::PageRecord;

use super::ConvertError;

/// Output encoding for rendered page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    #[default]
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            other => Err(format!("unknown image format: {other}")),
        }
    }
}

/// Settings for a single page render.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Scale relative to the page's natural size at 72 DPI. Clamped to
    /// 0.1-4.0 at render time.
    pub scale: f32,
    pub format: ImageFormat,
    /// JPEG quality (1-100); ignored for PNG.
    pub quality: u8,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: 1.5,
            format: ImageFormat::Jpeg,
            quality: 85,
        }
    }
}

/// A rasterized, encoded page image ready for upload.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_number: u32,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// A page that could not be converted, with the raw fault attached.
#[derive(Debug)]
pub struct FailedPage {
    pub page_number: u32,
    pub error: ConvertError,
}

/// Outcome of converting a whole document. `records` carry a zero
/// TTL until the cache stamps them on insert.
#[derive(Debug)]
pub struct ConversionReport {
    pub document_id: String,
    pub total_pages: u32,
    pub records: Vec<PageRecord>,
    pub failures: Vec<FailedPage>,
}

impl ConversionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.records.len() as u32 == self.total_pages
    }
}
