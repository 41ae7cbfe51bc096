use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::info;

/// The crawl metrics, owned by whoever builds the supervisor and handed to
/// workers by reference. Nothing here is module-global; two crawlers in one
/// test process get two registries.
pub struct Metrics {
    registry: Registry,
    pub worker_processed: IntCounterVec,
    pub worker_failed: IntCounterVec,
    pub requests: IntCounterVec,
    pub failed_requests: IntCounterVec,
    pub crawled_pages: IntCounterVec,
    pub skipped_links: IntCounterVec,
    pub worker_active: IntGaugeVec,
    pub queue_pending: IntGauge,
    pub request_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let worker_processed = counter_vec(
            &registry,
            "jooya_worker_processed_total",
            "Tasks a worker completed successfully",
            &["worker_id"],
        )?;
        let worker_failed = counter_vec(
            &registry,
            "jooya_worker_failed_total",
            "Tasks a worker marked as failed",
            &["worker_id"],
        )?;
        let requests = counter_vec(
            &registry,
            "jooya_requests_total",
            "HTTP page requests issued",
            &["worker"],
        )?;
        let failed_requests = counter_vec(
            &registry,
            "jooya_failed_requests_total",
            "HTTP page requests that ended in an error",
            &["worker"],
        )?;
        let crawled_pages = counter_vec(
            &registry,
            "jooya_crawled_pages_total",
            "Pages fetched, parsed and persisted",
            &["worker"],
        )?;
        let skipped_links = counter_vec(
            &registry,
            "jooya_skipped_links_total",
            "Fetches and links skipped, by reason",
            &["reason"],
        )?;

        let worker_active = IntGaugeVec::new(
            Opts::new("jooya_worker_active", "Whether a worker task is currently running"),
            &["worker_id"],
        )?;
        registry.register(Box::new(worker_active.clone()))?;

        let queue_pending = IntGauge::new(
            "jooya_queue_pending",
            "Frontier rows eligible for dequeue right now",
        )?;
        registry.register(Box::new(queue_pending.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new("jooya_request_latency_seconds", "Wall-clock time of one page fetch")
                .buckets(vec![0.1, 0.3, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["worker"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            registry,
            worker_processed,
            worker_failed,
            requests,
            failed_requests,
            crawled_pages,
            skipped_links,
            worker_active,
            queue_pending,
            request_latency,
        })
    }

    /// Prometheus text exposition of everything registered here.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Serve `GET /metrics` until the shutdown channel fires.
pub async fn serve(port: u16, metrics: Arc<Metrics>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_render_in_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.worker_processed.with_label_values(&["0"]).inc();
        metrics.skipped_links.with_label_values(&["body_too_large"]).inc();
        metrics.queue_pending.set(7);
        metrics.request_latency.with_label_values(&["0"]).observe(0.42);

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();

        assert!(text.contains("jooya_worker_processed_total"));
        assert!(text.contains("jooya_skipped_links_total"));
        assert!(text.contains("jooya_queue_pending 7"));
        assert!(text.contains("jooya_request_latency_seconds_bucket"));
    }

    #[test]
    fn two_instances_do_not_collide() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.queue_pending.set(1);
        second.queue_pending.set(2);
        assert!(String::from_utf8(second.render().unwrap())
            .unwrap()
            .contains("jooya_queue_pending 2"));
    }
}
