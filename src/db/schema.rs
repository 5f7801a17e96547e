//! Database schema initialization

use sqlx::SqlitePool;

use super::MetadataError;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), MetadataError> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Registered source documents
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    source_key TEXT NOT NULL,
    -- NULL until the document has been opened and counted once
    page_count INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);

-- Converted page images (one row per cached page)
CREATE TABLE IF NOT EXISTS pages (
    document_id TEXT NOT NULL,
    -- 1-indexed
    page_number INTEGER NOT NULL,
    blob_key TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    -- Pixel dimensions; 0 when unknown (records rebuilt from blob listings)
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    sha256 TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,

    PRIMARY KEY (document_id, page_number)
);

CREATE INDEX IF NOT EXISTS idx_pages_expires ON pages(expires_at);
"#;
