use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

mod raw;

pub use raw::{PgRawStore, RawStore};

/// One outbound edge of the link graph.
#[derive(Debug, Clone)]
pub struct OutboundLinkRecord {
    pub target_url: String,
    pub is_internal: bool,
}

/// Everything the worker persists for a fetched page, written in a single
/// transaction so a cancelled worker never leaves a page half-recorded.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub url: String,
    pub status_code: i32,
    pub title: String,
    pub content_preview: String,
    pub html_length: i32,
    pub text_length: i32,
    pub link_count: i32,
    pub language: Option<String>,
    pub content_hash: String,
    pub links: Vec<OutboundLinkRecord>,
}

#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub async fn connect(database_url: &str, min_connections: u32, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the frontier and policy layers.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Upsert the page record, its metadata and the outbound link set
    /// atomically. Links are replaced, not appended: a recrawl reflects the
    /// page as it is now.
    pub async fn store_crawl_result(&self, page: &PageRecord) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let (page_id,): (i64,) = sqlx::query_as(
            "INSERT INTO crawled_pages (url, status_code, title, content, fetched_at) \
             VALUES ($1, $2, $3, $4, NOW()) \
             ON CONFLICT (url) DO UPDATE SET \
                 status_code = EXCLUDED.status_code, \
                 title = EXCLUDED.title, \
                 content = EXCLUDED.content, \
                 fetched_at = NOW() \
             RETURNING id",
        )
        .bind(&page.url)
        .bind(page.status_code)
        .bind(&page.title)
        .bind(&page.content_preview)
        .fetch_one(&mut *tx)
        .await?;

        // `keywords` stays NULL here; the analysis service fills it in.
        sqlx::query(
            "INSERT INTO page_metadata \
                 (page_id, html_length, text_length, link_count, language, content_hash) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (page_id) DO UPDATE SET \
                 html_length = EXCLUDED.html_length, \
                 text_length = EXCLUDED.text_length, \
                 link_count = EXCLUDED.link_count, \
                 language = EXCLUDED.language, \
                 content_hash = EXCLUDED.content_hash",
        )
        .bind(page_id)
        .bind(page.html_length)
        .bind(page.text_length)
        .bind(page.link_count)
        .bind(&page.language)
        .bind(&page.content_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM outbound_links WHERE source_page_id = $1")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;

        if !page.links.is_empty() {
            let mut targets: Vec<String> = Vec::with_capacity(page.links.len());
            let mut internal: Vec<bool> = Vec::with_capacity(page.links.len());
            for link in &page.links {
                targets.push(link.target_url.clone());
                internal.push(link.is_internal);
            }
            sqlx::query(
                "INSERT INTO outbound_links (source_page_id, target_url, is_internal) \
                 SELECT $1, * FROM UNNEST($2::text[], $3::bool[])",
            )
            .bind(page_id)
            .bind(&targets)
            .bind(&internal)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(page_id)
    }

    /// Append to the error log. Messages are capped so a traceback cannot
    /// bloat the table.
    pub async fn log_error(
        &self,
        url: &str,
        status_code: Option<i32>,
        message: &str,
        worker_id: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_error_logs (url, status_code, error_message, worker_id) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(url)
        .bind(status_code)
        .bind(truncate_message(message))
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn frontier_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM urls_frontier GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn page_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM crawled_pages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn link_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM outbound_links")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn error_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM crawl_error_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

const MAX_ERROR_MESSAGE_CHARS: usize = 512;

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Duplicate-detection hash: SHA-256 over the extracted text, or over the
/// HTML when extraction produced nothing.
pub fn content_hash(text: &str, html: &str) -> String {
    let mut hasher = Sha256::new();
    if text.is_empty() {
        hasher.update(html.as_bytes());
    } else {
        hasher.update(text.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
