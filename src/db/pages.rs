//! SQLite-backed document and page persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePool};
use sqlx::Sqlite;

use crate::document::{DocumentRecord, PageRecord};

use super::{create_pool, fmt_ts, parse_ts, MetadataError, MetadataStore};

/// Metadata store backed by a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (and if necessary create) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, MetadataError> {
        Ok(Self::new(create_pool(database_url).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    title: String,
    source_key: String,
    page_count: Option<i64>,
    created_at: String,
}

impl DocumentRow {
    fn into_record(self) -> Result<DocumentRecord, MetadataError> {
        Ok(DocumentRecord {
            id: self.id,
            title: self.title,
            source_key: self.source_key,
            page_count: self.page_count.map(|count| count as u32),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PageRow {
    document_id: String,
    page_number: i64,
    blob_key: String,
    byte_size: i64,
    width: i64,
    height: i64,
    sha256: String,
    created_at: String,
    expires_at: String,
}

impl PageRow {
    fn into_record(self) -> Result<PageRecord, MetadataError> {
        Ok(PageRecord {
            document_id: self.document_id,
            page_number: self.page_number as u32,
            blob_key: self.blob_key,
            byte_size: self.byte_size as u64,
            width: self.width as u32,
            height: self.height as u32,
            sha256: self.sha256,
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
        })
    }
}

const UPSERT_PAGE_SQL: &str = r#"
    INSERT INTO pages (document_id, page_number, blob_key, byte_size,
                       width, height, sha256, created_at, expires_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(document_id, page_number) DO UPDATE SET
        blob_key = excluded.blob_key,
        byte_size = excluded.byte_size,
        width = excluded.width,
        height = excluded.height,
        sha256 = excluded.sha256,
        created_at = excluded.created_at,
        expires_at = excluded.expires_at
"#;

fn bind_page<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &'q PageRecord,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&record.document_id)
        .bind(record.page_number as i64)
        .bind(&record.blob_key)
        .bind(record.byte_size as i64)
        .bind(record.width as i64)
        .bind(record.height as i64)
        .bind(&record.sha256)
        .bind(fmt_ts(record.created_at))
        .bind(fmt_ts(record.expires_at))
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert_document(&self, document: &DocumentRecord) -> Result<(), MetadataError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, title, source_key, page_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source_key = excluded.source_key,
                page_count = excluded.page_count
            "#,
        )
        .bind(&document.id)
        .bind(&document.title)
        .bind(&document.source_key)
        .bind(document.page_count.map(|count| count as i64))
        .bind(fmt_ts(document.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, MetadataError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, title, source_key, page_count, created_at
            FROM documents
            WHERE id = ?
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_record).transpose()
    }

    async fn set_page_count(
        &self,
        document_id: &str,
        page_count: u32,
    ) -> Result<(), MetadataError> {
        sqlx::query("UPDATE documents SET page_count = ? WHERE id = ?")
            .bind(page_count as i64)
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), MetadataError> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert_page(&self, record: &PageRecord) -> Result<(), MetadataError> {
        bind_page(sqlx::query(UPSERT_PAGE_SQL), record)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert_pages(&self, records: &[PageRecord]) -> Result<(), MetadataError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            bind_page(sqlx::query(UPSERT_PAGE_SQL), record)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_page(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<PageRecord>, MetadataError> {
        let row = sqlx::query_as::<_, PageRow>(
            r#"
            SELECT document_id, page_number, blob_key, byte_size,
                   width, height, sha256, created_at, expires_at
            FROM pages
            WHERE document_id = ? AND page_number = ?
            "#,
        )
        .bind(document_id)
        .bind(page_number as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PageRow::into_record).transpose()
    }

    async fn find_pages(&self, document_id: &str) -> Result<Vec<PageRecord>, MetadataError> {
        let rows = sqlx::query_as::<_, PageRow>(
            r#"
            SELECT document_id, page_number, blob_key, byte_size,
                   width, height, sha256, created_at, expires_at
            FROM pages
            WHERE document_id = ?
            ORDER BY page_number ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PageRow::into_record).collect()
    }

    async fn delete_page(&self, document_id: &str, page_number: u32) -> Result<(), MetadataError> {
        sqlx::query("DELETE FROM pages WHERE document_id = ? AND page_number = ?")
            .bind(document_id)
            .bind(page_number as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_pages(&self, document_id: &str) -> Result<(), MetadataError> {
        sqlx::query("DELETE FROM pages WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, MetadataError> {
        let result = sqlx::query("DELETE FROM pages WHERE expires_at < ?")
            .bind(fmt_ts(before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
