//! PDF rasterization via MuPDF.
//!
//! [`PdfRenderer`] holds the source bytes and reopens the document per
//! operation; MuPDF document handles are not thread-safe, so none are
//! retained. [`SafeRenderer`] adds the mutex that serializes renders
//! when a renderer is shared across tasks.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use mupdf::{Colorspace, Document, Matrix};
use parking_lot::Mutex;

use super::types::{ImageFormat, RenderOptions, RenderedPage};
use super::ConvertError;

const THUMBNAIL_QUALITY: u8 = 75;

/// Renders pages of a single PDF.
pub struct PdfRenderer {
    data: Vec<u8>,
    page_count: u32,
}

impl PdfRenderer {
    /// Parse the document header and page tree. Fails fast on bytes
    /// MuPDF cannot open, and on documents with no pages at all.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ConvertError> {
        let doc = Document::from_bytes(&data, "application/pdf")?;
        let page_count = doc.page_count()? as u32;

        if page_count == 0 {
            return Err(ConvertError::EmptyDocument);
        }

        Ok(Self { data, page_count })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    fn open_document(&self) -> Result<Document, ConvertError> {
        Document::from_bytes(&self.data, "application/pdf").map_err(Into::into)
    }

    fn validate_page(&self, page_number: u32) -> Result<(), ConvertError> {
        if page_number < 1 || page_number > self.page_count {
            return Err(ConvertError::PageOutOfRange {
                page: page_number,
                total: self.page_count,
            });
        }
        Ok(())
    }

    /// Render a page (1-indexed) to an encoded image.
    pub fn render_page(
        &self,
        page_number: u32,
        options: &RenderOptions,
    ) -> Result<RenderedPage, ConvertError> {
        self.validate_page(page_number)?;

        let doc = self.open_document()?;
        let page = doc.load_page((page_number - 1) as i32)?;

        // Clamp scale to prevent DoS (0.1 to 4.0)
        let scale = options.scale.clamp(0.1, 4.0);
        let matrix = Matrix::new_scale(scale, scale);

        // to_pixmap signature: (ctm, colorspace, alpha, show_extras) -> Pixmap
        let colorspace = Colorspace::device_rgb();
        let pixmap = page.to_pixmap(&matrix, &colorspace, true, true)?;

        encode_pixmap(&pixmap, page_number, options.format, options.quality)
    }

    /// Render a low-resolution thumbnail that fits in `max_px` on its
    /// longest side.
    pub fn render_thumbnail(
        &self,
        page_number: u32,
        max_px: u32,
    ) -> Result<RenderedPage, ConvertError> {
        self.validate_page(page_number)?;

        let doc = self.open_document()?;
        let page = doc.load_page((page_number - 1) as i32)?;
        let bounds = page.bounds()?;

        let width = bounds.x1 - bounds.x0;
        let height = bounds.y1 - bounds.y0;
        let longest = width.max(height);
        if longest <= 0.0 {
            return Err(ConvertError::Encode("page has empty bounds".to_string()));
        }

        let scale = ((max_px as f32) / longest).clamp(0.05, 4.0);
        let matrix = Matrix::new_scale(scale, scale);
        let colorspace = Colorspace::device_rgb();
        let pixmap = page.to_pixmap(&matrix, &colorspace, true, false)?;

        // JPEG for smaller thumbnails
        encode_pixmap(&pixmap, page_number, ImageFormat::Jpeg, THUMBNAIL_QUALITY)
    }
}

/// Encode pixmap samples into the requested image format.
fn encode_pixmap(
    pixmap: &mupdf::Pixmap,
    page_number: u32,
    format: ImageFormat,
    quality: u8,
) -> Result<RenderedPage, ConvertError> {
    let width = pixmap.width() as u32;
    let height = pixmap.height() as u32;
    let samples = pixmap.samples();
    let n = pixmap.n() as usize; // components per pixel

    // Convert to RGBA image buffer
    let mut rgba_buffer = Vec::with_capacity((width * height * 4) as usize);

    for y in 0..height as usize {
        for x in 0..width as usize {
            let offset = (y * width as usize + x) * n;
            let r = samples.get(offset).copied().unwrap_or(0);
            let g = samples.get(offset + 1).copied().unwrap_or(0);
            let b = samples.get(offset + 2).copied().unwrap_or(0);
            let a = if n >= 4 {
                samples.get(offset + 3).copied().unwrap_or(255)
            } else {
                255
            };
            rgba_buffer.extend_from_slice(&[r, g, b, a]);
        }
    }

    let img = image::RgbaImage::from_raw(width, height, rgba_buffer)
        .ok_or_else(|| ConvertError::Encode("failed to create image buffer".to_string()))?;
    let dynamic_img = image::DynamicImage::ImageRgba8(img);

    let mut output = Vec::new();
    match format {
        ImageFormat::Png => {
            dynamic_img
                .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
                .map_err(|err| ConvertError::Encode(err.to_string()))?;
        }
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel; flatten first.
            let rgb = image::DynamicImage::ImageRgb8(dynamic_img.to_rgb8());
            let mut cursor = Cursor::new(&mut output);
            let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|err| ConvertError::Encode(err.to_string()))?;
        }
    }

    Ok(RenderedPage {
        page_number,
        bytes: output,
        width,
        height,
        format,
    })
}

/// A [`PdfRenderer`] shareable across tasks. The mutex serializes
/// renders; MuPDF gets no concurrent calls through one instance.
pub struct SafeRenderer {
    inner: Mutex<PdfRenderer>,
    page_count: u32,
}

impl SafeRenderer {
    pub fn new(renderer: PdfRenderer) -> Self {
        let page_count = renderer.page_count();
        Self {
            inner: Mutex::new(renderer),
            page_count,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ConvertError> {
        Ok(Self::new(PdfRenderer::from_bytes(data)?))
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn render_page(
        &self,
        page_number: u32,
        options: &RenderOptions,
    ) -> Result<RenderedPage, ConvertError> {
        self.inner.lock().render_page(page_number, options)
    }

    pub fn render_thumbnail(
        &self,
        page_number: u32,
        max_px: u32,
    ) -> Result<RenderedPage, ConvertError> {
        self.inner.lock().render_thumbnail(page_number, max_px)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal single-page PDF (612x792pt) that MuPDF can open.
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

    #[test]
    fn opens_a_valid_document() {
        let renderer = PdfRenderer::from_bytes(minimal_pdf()).unwrap();
        assert_eq!(renderer.page_count(), 1);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(PdfRenderer::from_bytes(b"not a pdf at all".to_vec()).is_err());
    }

    #[test]
    fn renders_at_the_requested_scale() {
        let renderer = PdfRenderer::from_bytes(minimal_pdf()).unwrap();
        let options = RenderOptions {
            scale: 1.5,
            format: ImageFormat::Png,
            quality: 85,
        };

        let rendered = renderer.render_page(1, &options).unwrap();
        assert_eq!(rendered.width, 918); // 612 * 1.5
        assert_eq!(rendered.height, 1188); // 792 * 1.5
        assert!(!rendered.bytes.is_empty());
    }

    #[test]
    fn jpeg_output_honors_the_format() {
        let renderer = PdfRenderer::from_bytes(minimal_pdf()).unwrap();
        let options = RenderOptions {
            scale: 1.0,
            format: ImageFormat::Jpeg,
            quality: 70,
        };

        let rendered = renderer.render_page(1, &options).unwrap();
        // JPEG magic bytes.
        assert_eq!(&rendered.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn page_zero_and_past_the_end_are_out_of_range() {
        let renderer = PdfRenderer::from_bytes(minimal_pdf()).unwrap();
        let options = RenderOptions::default();

        assert!(matches!(
            renderer.render_page(0, &options),
            Err(ConvertError::PageOutOfRange { page: 0, total: 1 })
        ));
        assert!(matches!(
            renderer.render_page(2, &options),
            Err(ConvertError::PageOutOfRange { page: 2, total: 1 })
        ));
    }

    #[test]
    fn thumbnail_fits_the_pixel_budget() {
        let renderer = PdfRenderer::from_bytes(minimal_pdf()).unwrap();
        let rendered = renderer.render_thumbnail(1, 200).unwrap();
        assert!(rendered.width <= 200);
        assert!(rendered.height <= 200);
    }
}
