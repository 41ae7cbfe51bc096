use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use jooya_core::{ErrorCategory, FrontierTask};

/// Leases older than this are considered abandoned (worker crash, lost
/// connection) and handed back to the queue.
const LEASE_TIMEOUT_SECS: u64 = 30 * 60;
/// How often one process bothers running the lease sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const ENQUEUE_UPSERT: &str = "\
    ON CONFLICT (url, source_id) DO UPDATE SET \
        depth = LEAST(urls_frontier.depth, EXCLUDED.depth), \
        priority = GREATEST(urls_frontier.priority, EXCLUDED.priority), \
        status = CASE WHEN urls_frontier.status = 'DONE' AND NOT $5 \
                      THEN urls_frontier.status ELSE 'SCHEDULED' END, \
        scheduled_for = CASE WHEN urls_frontier.status = 'DONE' AND NOT $5 \
                             THEN urls_frontier.scheduled_for ELSE EXCLUDED.scheduled_for END, \
        last_scheduled_at = CASE WHEN urls_frontier.status = 'DONE' AND NOT $5 \
                                 THEN urls_frontier.last_scheduled_at ELSE EXCLUDED.last_scheduled_at END, \
        updated_at = NOW()";

#[derive(Debug, Clone, Default)]
pub struct FrontierOptions {
    pub max_depth: Option<i32>,
    pub max_pages: Option<u64>,
}

/// The persistent work queue over `urls_frontier`. Many workers — in this
/// process or others sharing the database — dequeue concurrently; the
/// `FOR UPDATE SKIP LOCKED` lease guarantees each task a single holder.
pub struct Frontier {
    pool: PgPool,
    max_depth: Option<i32>,
    max_pages: Option<u64>,
    /// Pages finished by this process. Read without coordination for the page
    /// cap, so the cap can be overshot by at most workers-1 pages.
    crawled_count: AtomicU64,
    last_lease_sweep: Mutex<Instant>,
}

impl Frontier {
    pub fn new(pool: PgPool, options: FrontierOptions) -> Self {
        Self {
            pool,
            max_depth: options.max_depth,
            max_pages: options.max_pages,
            crawled_count: AtomicU64::new(0),
            last_lease_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Insert or refresh one frontier row. Returns false when the URL was
    /// rejected by the depth limit or the page cap.
    ///
    /// Upsert semantics on (url, source_id): depth takes the minimum,
    /// priority the maximum, and a DONE row keeps its state unless
    /// `force_recrawl` re-activates it.
    pub async fn enqueue(
        &self,
        url: &str,
        source_id: i32,
        depth: i32,
        priority: i32,
        force_recrawl: bool,
    ) -> Result<bool> {
        if self.depth_exceeded(depth) {
            debug!(url, depth, "enqueue skipped: past depth limit");
            return Ok(false);
        }
        if self.page_cap_reached() {
            return Ok(false);
        }

        let sql = format!(
            "INSERT INTO urls_frontier \
                 (url, source_id, depth, priority, status, scheduled_for, last_scheduled_at) \
             VALUES ($1, $2, $3, $4, 'SCHEDULED', NOW(), NOW()) {ENQUEUE_UPSERT}"
        );
        sqlx::query(&sql)
            .bind(url)
            .bind(source_id)
            .bind(depth)
            .bind(priority)
            .bind(force_recrawl)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// Batched `enqueue` with the same semantics, one round trip for the
    /// whole set. Returns how many URLs were submitted.
    pub async fn enqueue_many(
        &self,
        urls: &[String],
        source_id: i32,
        depth: i32,
        priority: i32,
        force_recrawl: bool,
    ) -> Result<usize> {
        if urls.is_empty() || self.depth_exceeded(depth) || self.page_cap_reached() {
            return Ok(0);
        }

        // ON CONFLICT cannot touch the same row twice within one statement.
        let mut seen = HashSet::new();
        let unique: Vec<String> = urls
            .iter()
            .filter(|u| seen.insert(u.as_str()))
            .cloned()
            .collect();

        let sql = format!(
            "INSERT INTO urls_frontier \
                 (url, source_id, depth, priority, status, scheduled_for, last_scheduled_at) \
             SELECT u, $2, $3, $4, 'SCHEDULED', NOW(), NOW() \
             FROM UNNEST($1::text[]) AS u {ENQUEUE_UPSERT}"
        );
        sqlx::query(&sql)
            .bind(&unique)
            .bind(source_id)
            .bind(depth)
            .bind(priority)
            .bind(force_recrawl)
            .execute(&self.pool)
            .await?;
        Ok(unique.len())
    }

    /// Lease the most urgent eligible task: highest priority first, insertion
    /// order within a priority. Returns None when nothing is eligible.
    pub async fn dequeue(&self) -> Result<Option<FrontierTask>> {
        if self.page_cap_reached() {
            return Ok(None);
        }

        self.sweep_expired_leases().await?;

        let row: Option<(i64, String, i32, i32, i32)> = sqlx::query_as(
            "WITH next_task AS ( \
                 SELECT id FROM urls_frontier \
                 WHERE status = 'SCHEDULED' \
                   AND (scheduled_for IS NULL OR scheduled_for <= NOW()) \
                 ORDER BY priority DESC, id ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             UPDATE urls_frontier AS f \
             SET status = 'IN_PROGRESS', updated_at = NOW() \
             FROM next_task \
             WHERE f.id = next_task.id \
             RETURNING f.id, f.url, f.source_id, f.depth, f.priority",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, url, source_id, depth, priority)| FrontierTask {
            id,
            url,
            source_id,
            depth,
            priority,
        }))
    }

    pub async fn mark_done(&self, task_id: i64, status_code: Option<i32>) -> Result<()> {
        sqlx::query(
            "UPDATE urls_frontier \
             SET status = 'DONE', fail_count = 0, last_http_status = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(status_code)
        .execute(&self.pool)
        .await?;
        self.crawled_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return a failed task to the queue with exponential backoff. The row
    /// stays lockable by other processes only after the transaction commits,
    /// so fail_count cannot be double-incremented.
    pub async fn mark_failed(
        &self,
        task_id: i64,
        status_code: Option<i32>,
        error_code: Option<&str>,
        category: ErrorCategory,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let fail_count: Option<i32> =
            sqlx::query_scalar("SELECT COALESCE(fail_count, 0) FROM urls_frontier WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(fail_count) = fail_count else {
            return Ok(());
        };

        sqlx::query(
            "UPDATE urls_frontier \
             SET status = 'SCHEDULED', \
                 fail_count = $2, \
                 last_http_status = $3, \
                 last_error_code = $4, \
                 error_category = $5, \
                 scheduled_for = NOW() + make_interval(secs => $6), \
                 last_scheduled_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(fail_count + 1)
        .bind(status_code)
        .bind(error_code)
        .bind(category.as_str())
        .bind(backoff_seconds(fail_count) as f64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Rows eligible for dequeue right now. Feeds the queue-pending gauge.
    pub async fn count_scheduled(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM urls_frontier \
             WHERE status = 'SCHEDULED' AND (scheduled_for IS NULL OR scheduled_for <= NOW())",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub fn pages_crawled(&self) -> u64 {
        self.crawled_count.load(Ordering::Relaxed)
    }

    pub fn page_cap_reached(&self) -> bool {
        self.max_pages
            .is_some_and(|max| self.crawled_count.load(Ordering::Relaxed) >= max)
    }

    fn depth_exceeded(&self, depth: i32) -> bool {
        self.max_depth.is_some_and(|max| depth > max)
    }

    /// Liveness scavenger: leases abandoned by crashed workers re-enter the
    /// queue after the timeout. Throttled so the fleet does not hammer the
    /// table with idle sweeps.
    async fn sweep_expired_leases(&self) -> Result<()> {
        {
            let mut last = self.last_lease_sweep.lock().await;
            if last.elapsed() < SWEEP_INTERVAL {
                return Ok(());
            }
            *last = Instant::now();
        }

        let swept = sqlx::query(
            "UPDATE urls_frontier \
             SET status = 'SCHEDULED', scheduled_for = NOW(), updated_at = NOW() \
             WHERE status = 'IN_PROGRESS' AND updated_at < NOW() - make_interval(secs => $1)",
        )
        .bind(LEASE_TIMEOUT_SECS as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            warn!(swept, "released expired task leases");
        }
        Ok(())
    }
}

/// Retry delay after a failure: 30 * 2^(fail_count + 1) seconds, capped at
/// half an hour.
pub fn backoff_seconds(fail_count: i32) -> i64 {
    let exp = fail_count.saturating_add(1).clamp(1, 6) as u32;
    (30i64 << exp).min(1800)
}
