use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::PgPool;
use tracing::warn;

/// Bodies larger than this are stored gzip-compressed.
const GZIP_THRESHOLD: usize = 200_000;

/// The blob-store seam. The crawler core only ever calls these two
/// operations; deployments can swap in an external document store.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn store_raw(&self, url: &str, status_code: u16, body: &[u8]) -> Result<()>;
    async fn exists(&self, url: &str) -> Result<bool>;
}

/// What to do with an incoming body of a given size: drop it, store the
/// (possibly truncated) bytes as text, or store them gzip-compressed.
#[derive(Debug, PartialEq, Eq)]
enum RawSizeDecision<'a> {
    Reject,
    Store(&'a [u8]),
    Gzip(&'a [u8]),
}

/// Size policy: anything past ten times `max_html_bytes` is not worth
/// keeping, the rest is truncated to `max_html_bytes`, and truncated bodies
/// past the gzip threshold are compressed.
fn classify(body: &[u8], max_html_bytes: usize) -> RawSizeDecision<'_> {
    let absurd_limit = max_html_bytes.saturating_mul(10);
    if body.len() > absurd_limit {
        return RawSizeDecision::Reject;
    }

    let truncated = &body[..body.len().min(max_html_bytes)];
    if truncated.len() > GZIP_THRESHOLD {
        RawSizeDecision::Gzip(truncated)
    } else {
        RawSizeDecision::Store(truncated)
    }
}

/// Raw pages in Postgres, sharing the relational pool.
pub struct PgRawStore {
    pool: PgPool,
    max_html_bytes: usize,
}

impl PgRawStore {
    pub fn new(pool: PgPool, max_html_bytes: usize) -> Self {
        Self {
            pool,
            max_html_bytes,
        }
    }
}

#[async_trait]
impl RawStore for PgRawStore {
    async fn store_raw(&self, url: &str, status_code: u16, body: &[u8]) -> Result<()> {
        match classify(body, self.max_html_bytes) {
            RawSizeDecision::Reject => {
                warn!(url, size = body.len(), "skipping persist for overly large document");
                Ok(())
            }
            RawSizeDecision::Gzip(truncated) => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(truncated)?;
                let compressed = encoder.finish()?;

                sqlx::query(
                    "INSERT INTO raw_pages \
                         (url, status_code, body, body_compressed, compression, length, compressed_length, fetched_at) \
                     VALUES ($1, $2, NULL, $3, 'gzip', $4, $5, NOW()) \
                     ON CONFLICT (url) DO UPDATE SET \
                         status_code = EXCLUDED.status_code, \
                         body = NULL, \
                         body_compressed = EXCLUDED.body_compressed, \
                         compression = 'gzip', \
                         length = EXCLUDED.length, \
                         compressed_length = EXCLUDED.compressed_length, \
                         fetched_at = NOW()",
                )
                .bind(url)
                .bind(i32::from(status_code))
                .bind(&compressed)
                .bind(truncated.len() as i32)
                .bind(compressed.len() as i32)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            RawSizeDecision::Store(truncated) => {
                let text = String::from_utf8_lossy(truncated);
                sqlx::query(
                    "INSERT INTO raw_pages \
                         (url, status_code, body, body_compressed, compression, length, compressed_length, fetched_at) \
                     VALUES ($1, $2, $3, NULL, NULL, $4, NULL, NOW()) \
                     ON CONFLICT (url) DO UPDATE SET \
                         status_code = EXCLUDED.status_code, \
                         body = EXCLUDED.body, \
                         body_compressed = NULL, \
                         compression = NULL, \
                         length = EXCLUDED.length, \
                         compressed_length = NULL, \
                         fetched_at = NOW()",
                )
                .bind(url)
                .bind(i32::from(status_code))
                .bind(text.as_ref())
                .bind(truncated.len() as i32)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    async fn exists(&self, url: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM raw_pages WHERE url = $1)")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_HTML_BYTES: usize = 500_000;

    #[test]
    fn small_bodies_are_stored_as_text() {
        let body = vec![b'a'; 1_000];
        assert_eq!(
            classify(&body, MAX_HTML_BYTES),
            RawSizeDecision::Store(&body[..])
        );
    }

    #[test]
    fn gzip_starts_just_past_the_threshold() {
        let at_threshold = vec![b'a'; GZIP_THRESHOLD];
        assert_eq!(
            classify(&at_threshold, MAX_HTML_BYTES),
            RawSizeDecision::Store(&at_threshold[..])
        );

        let past_threshold = vec![b'a'; GZIP_THRESHOLD + 1];
        assert_eq!(
            classify(&past_threshold, MAX_HTML_BYTES),
            RawSizeDecision::Gzip(&past_threshold[..])
        );
    }

    #[test]
    fn oversized_bodies_are_truncated_before_storing() {
        let body = vec![b'a'; MAX_HTML_BYTES + 50_000];
        match classify(&body, MAX_HTML_BYTES) {
            RawSizeDecision::Gzip(kept) => assert_eq!(kept.len(), MAX_HTML_BYTES),
            other => panic!("expected a truncated gzip decision, got {other:?}"),
        }
    }

    #[test]
    fn rejection_starts_just_past_ten_times_the_limit() {
        let at_limit = vec![b'a'; MAX_HTML_BYTES * 10];
        match classify(&at_limit, MAX_HTML_BYTES) {
            RawSizeDecision::Gzip(kept) => assert_eq!(kept.len(), MAX_HTML_BYTES),
            other => panic!("expected a truncated gzip decision, got {other:?}"),
        }

        let past_limit = vec![b'a'; MAX_HTML_BYTES * 10 + 1];
        assert_eq!(classify(&past_limit, MAX_HTML_BYTES), RawSizeDecision::Reject);
    }

    #[test]
    fn truncation_below_the_gzip_threshold_stays_plain() {
        let max = 100_000;
        let body = vec![b'a'; 300_000];
        match classify(&body, max) {
            RawSizeDecision::Store(kept) => assert_eq!(kept.len(), max),
            other => panic!("expected a truncated store decision, got {other:?}"),
        }
    }
}
