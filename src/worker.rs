use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use jooya_core::config::AppConfig;
use jooya_core::{ErrorCategory, FetchOutcome, FrontierTask};
use jooya_fetch::fetch_page;
use jooya_frontier::Frontier;
use jooya_metrics::Metrics;
use jooya_parser::{
    extract_language, extract_links, extract_text, extract_title, get_domain, is_valid_link,
};
use jooya_policy::PolicyController;
use jooya_robots::RobotsCache;
use jooya_storage::{content_hash, OutboundLinkRecord, PageRecord, RawStore, Storage};

const IDLE_SLEEP: Duration = Duration::from_secs(3);
/// Pages beyond this size are parsed from their leading slice only; the DOM
/// for a multi-megabyte page is not worth the allocation.
const MAX_PARSE_BYTES: usize = 500_000;
const MAX_LINKS_PER_PAGE: usize = 1_000;
const MAX_LINKS_HEAVY_PAGE: usize = 200;
const CONTENT_PREVIEW_CHARS: usize = 5_000;

/// One crawl worker: dequeue under lease, politeness gates, fetch, parse,
/// persist, enqueue discoveries, release the lease.
pub struct Worker {
    pub worker_id: usize,
    pub config: Arc<AppConfig>,
    pub client: Client,
    pub frontier: Arc<Frontier>,
    pub storage: Arc<Storage>,
    pub raw_store: Arc<dyn RawStore>,
    pub robots: Arc<RobotsCache>,
    pub policy: Arc<PolicyController>,
    pub metrics: Arc<Metrics>,
}

impl Worker {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let worker_label = self.worker_id.to_string();
        self.metrics.worker_active.with_label_values(&[&worker_label]).set(1);
        info!(worker_id = self.worker_id, "worker started");

        loop {
            if self.frontier.page_cap_reached() {
                info!(
                    worker_id = self.worker_id,
                    pages = self.frontier.pages_crawled(),
                    "page cap reached, stopping"
                );
                break;
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker_id = self.worker_id, "worker shutting down");
                    break;
                }
                _ = self.step(&worker_label) => {}
            }
        }

        self.metrics.worker_active.with_label_values(&[&worker_label]).set(0);
    }

    async fn step(&self, worker: &str) {
        match self.frontier.dequeue().await {
            Ok(Some(task)) => self.process_task(&task, worker).await,
            Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
            Err(e) => {
                error!(worker_id = self.worker_id, error = %e, "dequeue failed");
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    async fn process_task(&self, task: &FrontierTask, worker: &str) {
        debug!(worker_id = self.worker_id, url = %task.url, depth = task.depth, "dequeued");

        let url = match Url::parse(&task.url) {
            Ok(url) => url,
            Err(e) => {
                self.fail_task(task, None, ErrorCategory::ParseError, "bad_url", &e.to_string(), worker)
                    .await;
                return;
            }
        };

        if !self.path_allowed(&url) {
            debug!(url = %url, "outside the host path allowlist");
            self.finish_task(task, None, worker).await;
            return;
        }

        if !self.robots.is_allowed(&url).await {
            self.metrics
                .skipped_links
                .with_label_values(&["robots_disallowed"])
                .inc();
            debug!(url = %url, "disallowed by robots.txt");
            self.finish_task(task, None, worker).await;
            return;
        }

        if let Err(e) = self.policy.wait_turn(&url).await {
            self.fail_task(task, None, ErrorCategory::DbError, "policy", &e.to_string(), worker)
                .await;
            return;
        }

        self.metrics.requests.with_label_values(&[worker]).inc();
        let timer = self.metrics.request_latency.with_label_values(&[worker]).start_timer();
        let outcome = fetch_page(&self.client, &url, &self.config.fetch).await;
        timer.observe_duration();

        match outcome {
            FetchOutcome::Skipped { reason, status } => {
                self.metrics
                    .skipped_links
                    .with_label_values(&[reason.as_str()])
                    .inc();
                debug!(url = %url, reason = reason.as_str(), "fetch skipped");
                self.finish_task(task, status.map(i32::from), worker).await;
            }
            FetchOutcome::Failed { category, message } => {
                self.metrics.failed_requests.with_label_values(&[worker]).inc();
                self.fail_task(task, None, category, category.as_str(), &message, worker)
                    .await;
            }
            FetchOutcome::Fetched { status, body } => {
                if status == 404 || status == 410 {
                    debug!(url = %url, status, "page gone");
                    self.finish_task(task, Some(i32::from(status)), worker).await;
                } else if status >= 400 {
                    self.metrics.failed_requests.with_label_values(&[worker]).inc();
                    self.fail_task(
                        task,
                        Some(i32::from(status)),
                        ErrorCategory::Unexpected,
                        "http_error",
                        &format!("HTTP {status}"),
                        worker,
                    )
                    .await;
                } else if body.trim().is_empty() {
                    self.metrics.failed_requests.with_label_values(&[worker]).inc();
                    self.fail_task(
                        task,
                        Some(i32::from(status)),
                        ErrorCategory::Unexpected,
                        "empty_body",
                        "empty response body",
                        worker,
                    )
                    .await;
                } else {
                    self.persist_page(task, &url, status, &body, worker).await;
                }
            }
        }
    }

    async fn persist_page(&self, task: &FrontierTask, url: &Url, status: u16, body: &str, worker: &str) {
        let heavy = body.len() > MAX_PARSE_BYTES;
        let parse_slice = truncate_on_char_boundary(body, MAX_PARSE_BYTES);
        if heavy {
            debug!(url = %url, size = body.len(), "heavy page, parsing the leading slice only");
        }

        let title = extract_title(parse_slice);
        let text = extract_text(parse_slice);
        let base_domain = get_domain(url).to_string();

        let link_cap = if heavy { MAX_LINKS_HEAVY_PAGE } else { MAX_LINKS_PER_PAGE };
        let links: Vec<Url> = extract_links(url, parse_slice)
            .into_iter()
            .take(link_cap)
            .collect();
        let (link_records, frontier_targets) = partition_links(&links, &base_domain);

        let record = PageRecord {
            url: url.to_string(),
            status_code: i32::from(status),
            title,
            content_preview: truncate_chars(&text, CONTENT_PREVIEW_CHARS),
            html_length: body.len() as i32,
            text_length: text.len() as i32,
            link_count: links.len() as i32,
            language: extract_language(parse_slice),
            content_hash: content_hash(&text, body),
            links: link_records,
        };

        if let Err(e) = self.storage.store_crawl_result(&record).await {
            self.fail_task(
                task,
                Some(i32::from(status)),
                ErrorCategory::DbError,
                "db_write",
                &e.to_string(),
                worker,
            )
            .await;
            return;
        }

        if let Err(e) = self.raw_store.store_raw(url.as_str(), status, body.as_bytes()).await {
            warn!(url = %url, error = %e, "raw page store failed");
        }

        self.enqueue_links(task, frontier_targets).await;
        self.finish_task(task, Some(i32::from(status)), worker).await;
        self.metrics.crawled_pages.with_label_values(&[worker]).inc();
        info!(
            worker_id = self.worker_id,
            url = %url,
            status,
            links = record.link_count,
            "page crawled"
        );
    }

    async fn enqueue_links(&self, task: &FrontierTask, targets: Vec<String>) {
        if targets.is_empty() {
            return;
        }

        let next_depth = task.depth + 1;
        if let Some(max_depth) = self.config.crawler.max_depth {
            if next_depth > max_depth {
                self.metrics
                    .skipped_links
                    .with_label_values(&["max_depth"])
                    .inc_by(targets.len() as u64);
                return;
            }
        }

        match self
            .frontier
            .enqueue_many(&targets, task.source_id, next_depth, task.priority, false)
            .await
        {
            Ok(enqueued) if enqueued > 0 => debug!(url = %task.url, enqueued, "links enqueued"),
            Ok(_) => {}
            Err(e) => error!(url = %task.url, error = %e, "link enqueue failed"),
        }
    }

    async fn finish_task(&self, task: &FrontierTask, status_code: Option<i32>, worker: &str) {
        if let Err(e) = self.frontier.mark_done(task.id, status_code).await {
            error!(url = %task.url, error = %e, "mark_done failed, lease sweep will retake the task");
            return;
        }
        self.metrics.worker_processed.with_label_values(&[worker]).inc();
    }

    async fn fail_task(
        &self,
        task: &FrontierTask,
        status_code: Option<i32>,
        category: ErrorCategory,
        error_code: &str,
        message: &str,
        worker: &str,
    ) {
        warn!(
            worker_id = self.worker_id,
            url = %task.url,
            category = category.as_str(),
            "task failed: {message}"
        );
        self.metrics.worker_failed.with_label_values(&[worker]).inc();

        if let Err(e) = self
            .storage
            .log_error(&task.url, status_code, message, Some(self.worker_id as i32))
            .await
        {
            error!(url = %task.url, error = %e, "error log write failed");
        }
        if let Err(e) = self
            .frontier
            .mark_failed(task.id, status_code, Some(error_code), category)
            .await
        {
            error!(url = %task.url, error = %e, "mark_failed failed, lease sweep will retake the task");
        }
    }

    fn path_allowed(&self, url: &Url) -> bool {
        match self.config.politeness.host_path_allowlist.get(get_domain(url)) {
            Some(prefix) => url.path().starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Split a page's extracted links into what gets persisted (every link, with
/// its internal/external flag) and what enters the frontier (same-domain,
/// crawlable pages only).
fn partition_links(links: &[Url], base_domain: &str) -> (Vec<OutboundLinkRecord>, Vec<String>) {
    let records = links
        .iter()
        .map(|link| OutboundLinkRecord {
            target_url: link.to_string(),
            is_internal: get_domain(link) == base_domain,
        })
        .collect();
    let targets = links
        .iter()
        .filter(|link| is_valid_link(base_domain, link))
        .map(|link| link.to_string())
        .collect();
    (records, targets)
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_truncation_never_splits_a_char() {
        let s = "aé".repeat(400);
        let cut = truncate_on_char_boundary(&s, 601);
        assert!(cut.len() <= 601);
        assert!(s.starts_with(cut));

        assert_eq!(truncate_on_char_boundary("short", 1000), "short");
    }

    #[test]
    fn preview_truncation_counts_chars() {
        let s = "é".repeat(6000);
        assert_eq!(truncate_chars(&s, 5000).chars().count(), 5000);
        assert_eq!(truncate_chars("tiny", 5000), "tiny");
    }

    #[test]
    fn every_link_is_persisted_but_only_internal_pages_enter_the_frontier() {
        let links = vec![
            Url::parse("https://example.com/a").unwrap(),
            Url::parse("https://other.com/x").unwrap(),
            Url::parse("https://example.com/image.png").unwrap(),
        ];

        let (records, targets) = partition_links(&links, "example.com");

        assert_eq!(records.len(), 3);
        assert!(records[0].is_internal);
        assert!(!records[1].is_internal);
        assert!(records[2].is_internal);
        assert_eq!(targets, vec!["https://example.com/a".to_string()]);
    }
}
