//! Blob key layout for documents and their derived artifacts.
//!
//! Everything belonging to a document lives under its id as a prefix,
//! so a single prefix listing (or prefix delete) covers the whole
//! document. Current page images use the flat `{id}/page-{n}` form; the
//! nested `{id}/pages/{n}` form is the pre-0.3 layout and is still
//! probed as a fallback when the flat key is missing.

/// Prefix covering every blob belonging to a document.
pub fn document_prefix(document_id: &str) -> String {
    format!("{document_id}/")
}

/// Key of the original uploaded PDF.
pub fn source_key(document_id: &str) -> String {
    format!("{document_id}/source.pdf")
}

/// Key of a rendered page image.
pub fn page_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/page-{page_number}")
}

/// Pre-0.3 page key layout, kept for fallback reads only.
pub fn legacy_page_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/pages/{page_number}")
}

/// Key of a page thumbnail.
pub fn thumb_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/thumb-{page_number}")
}

/// Key of a synthesized placeholder image. Placeholders are served in
/// place of a page that could not be produced; they are never recorded
/// in the metadata store.
pub fn placeholder_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/placeholder-{page_number}")
}

/// Parse the page number out of a page image key, accepting both the
/// current and the legacy layout. Returns `None` for anything else
/// (source, thumbs, placeholders, foreign keys).
pub fn parse_page_key(document_id: &str, key: &str) -> Option<u32> {
    let rest = key.strip_prefix(document_id)?.strip_prefix('/')?;
    let number = rest
        .strip_prefix("page-")
        .or_else(|| rest.strip_prefix("pages/"))?;
    number.parse().ok()
}
