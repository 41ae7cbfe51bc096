use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use url::Url;

/// How many wait-and-recheck rounds a worker runs before claiming the slot
/// outright. Keeps a hot domain from starving one worker forever.
const MAX_WAIT_ROUNDS: usize = 8;

/// Per-domain rate limiting over `domain_crawl_policy`. All coordination goes
/// through the row lock; concurrent crawler processes serialize on
/// `SELECT ... FOR UPDATE` with no in-process state.
pub struct PolicyController {
    pool: PgPool,
}

struct PolicyRow {
    min_delay_ms: i32,
    last_crawled_at: Option<DateTime<Utc>>,
    next_allowed_at: Option<DateTime<Utc>>,
    daily_limit: i32,
    crawled_today: i32,
}

enum Decision {
    Proceed,
    Wait {
        next_allowed_at: DateTime<Utc>,
        sleep: Duration,
    },
}

impl PolicyController {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Block until the URL's domain grants a crawl slot. On return the slot
    /// is claimed: `last_crawled_at` is set and today's counter incremented.
    pub async fn wait_turn(&self, url: &Url) -> Result<()> {
        let Some(domain) = url.host_str().map(str::to_string) else {
            return Ok(());
        };

        for _ in 0..MAX_WAIT_ROUNDS {
            match self.try_claim(&domain).await? {
                None => return Ok(()),
                Some(sleep) => {
                    debug!(domain, sleep_ms = sleep.as_millis() as u64, "waiting for crawl slot");
                    tokio::time::sleep(sleep).await;
                }
            }
        }

        // Contended past the cap: claim after the final sleep so the worker
        // makes progress. Another process may have claimed in between; the
        // row lock keeps the counters consistent either way.
        self.claim_now(&domain).await
    }

    /// One locked round: read the row (inserting defaults on first sight),
    /// decide, and either claim the slot or publish `next_allowed_at` and
    /// report how long to sleep.
    async fn try_claim(&self, domain: &str) -> Result<Option<std::time::Duration>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO domain_crawl_policy (domain) VALUES ($1) ON CONFLICT (domain) DO NOTHING")
            .bind(domain)
            .execute(&mut *tx)
            .await?;

        let (min_delay_ms, last_crawled_at, next_allowed_at, daily_limit, crawled_today): (
            i32,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            i32,
            i32,
        ) = sqlx::query_as(
            "SELECT min_delay_ms, last_crawled_at, next_allowed_at, daily_limit, crawled_today \
             FROM domain_crawl_policy WHERE domain = $1 FOR UPDATE",
        )
        .bind(domain)
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut row = PolicyRow {
            min_delay_ms,
            last_crawled_at,
            next_allowed_at,
            daily_limit,
            crawled_today,
        };
        if day_rolled_over(row.last_crawled_at, now) {
            row.crawled_today = 0;
        }

        match decide(&row, now) {
            Decision::Proceed => {
                sqlx::query(
                    "UPDATE domain_crawl_policy \
                     SET last_crawled_at = $2, crawled_today = $3, next_allowed_at = NULL \
                     WHERE domain = $1",
                )
                .bind(domain)
                .bind(now)
                .bind(row.crawled_today + 1)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(None)
            }
            Decision::Wait {
                next_allowed_at,
                sleep,
            } => {
                sqlx::query(
                    "UPDATE domain_crawl_policy SET next_allowed_at = $2, crawled_today = $3 \
                     WHERE domain = $1",
                )
                .bind(domain)
                .bind(next_allowed_at)
                .bind(row.crawled_today)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(Some(sleep.to_std().unwrap_or_default()))
            }
        }
    }

    async fn claim_now(&self, domain: &str) -> Result<()> {
        sqlx::query(
            "UPDATE domain_crawl_policy \
             SET last_crawled_at = NOW(), crawled_today = crawled_today + 1, next_allowed_at = NULL \
             WHERE domain = $1",
        )
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// The wait arithmetic, separated from the transaction so it can be tested
/// against a fixed clock. `row.crawled_today` must already reflect the UTC
/// day reset.
fn decide(row: &PolicyRow, now: DateTime<Utc>) -> Decision {
    let min_delay = Duration::milliseconds(row.min_delay_ms as i64);
    let min_delay_wait = row
        .last_crawled_at
        .map(|last| last + min_delay - now)
        .unwrap_or_else(Duration::zero)
        .max(Duration::zero());
    let next_allowed_wait = row
        .next_allowed_at
        .map(|at| at - now)
        .unwrap_or_else(Duration::zero)
        .max(Duration::zero());
    let wait = min_delay_wait.max(next_allowed_wait);

    if row.crawled_today >= row.daily_limit {
        // Quota exhausted: push the domain to the next UTC day without
        // counting this attempt.
        let reset_at = start_of_next_utc_day(now);
        Decision::Wait {
            next_allowed_at: reset_at,
            sleep: wait.max(reset_at - now),
        }
    } else if wait > Duration::zero() {
        Decision::Wait {
            next_allowed_at: now + wait,
            sleep: wait,
        }
    } else {
        Decision::Proceed
    }
}

fn day_rolled_over(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last.is_some_and(|l| l.date_naive() < now.date_naive())
}

fn start_of_next_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + chrono::Days::new(1))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> PolicyRow {
        PolicyRow {
            min_delay_ms: 1000,
            last_crawled_at: None,
            next_allowed_at: None,
            daily_limit: 10_000,
            crawled_today: 0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_domain_proceeds_immediately() {
        assert!(matches!(decide(&row(), at(0)), Decision::Proceed));
    }

    #[test]
    fn min_delay_is_enforced() {
        let now = at(10);
        let mut r = row();
        r.min_delay_ms = 2000;
        r.last_crawled_at = Some(now - Duration::milliseconds(500));

        match decide(&r, now) {
            Decision::Wait {
                sleep,
                next_allowed_at,
            } => {
                assert_eq!(sleep, Duration::milliseconds(1500));
                assert_eq!(next_allowed_at, now + Duration::milliseconds(1500));
            }
            Decision::Proceed => panic!("expected a wait"),
        }
    }

    #[test]
    fn elapsed_min_delay_proceeds() {
        let now = at(10);
        let mut r = row();
        r.last_crawled_at = Some(now - Duration::milliseconds(1500));
        assert!(matches!(decide(&r, now), Decision::Proceed));
    }

    #[test]
    fn next_allowed_at_dominates_a_shorter_min_delay() {
        let now = at(0);
        let mut r = row();
        r.last_crawled_at = Some(now - Duration::milliseconds(900));
        r.next_allowed_at = Some(now + Duration::seconds(30));

        match decide(&r, now) {
            Decision::Wait { sleep, .. } => assert_eq!(sleep, Duration::seconds(30)),
            Decision::Proceed => panic!("expected a wait"),
        }
    }

    #[test]
    fn exhausted_quota_waits_for_the_next_utc_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 22, 0, 0).unwrap();
        let mut r = row();
        r.daily_limit = 100;
        r.crawled_today = 100;

        match decide(&r, now) {
            Decision::Wait {
                next_allowed_at,
                sleep,
            } => {
                let midnight = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
                assert_eq!(next_allowed_at, midnight);
                assert_eq!(sleep, Duration::hours(2));
            }
            Decision::Proceed => panic!("expected a wait"),
        }
    }

    #[test]
    fn day_rollover_resets_the_counter() {
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 13, 23, 59, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2026, 3, 14, 0, 1, 0).unwrap();
        assert!(day_rolled_over(Some(yesterday), today));
        assert!(!day_rolled_over(Some(today), today));
        assert!(!day_rolled_over(None, today));
    }

    #[test]
    fn next_day_starts_at_midnight_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 22, 30, 15).unwrap();
        assert_eq!(
            start_of_next_utc_day(now),
            Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap()
        );
    }
}
