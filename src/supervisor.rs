use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};

use jooya_core::config::{normalize_postgres_dsn, AppConfig};
use jooya_frontier::{Frontier, FrontierOptions};
use jooya_metrics::Metrics;
use jooya_policy::PolicyController;
use jooya_robots::RobotsCache;
use jooya_storage::{PgRawStore, RawStore, Storage};

use crate::worker::Worker;

const METRICS_PORT: u16 = 8000;
const QUEUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Wire everything together and run until a signal arrives: metrics endpoint,
/// queue-size sampler, and the worker pool, all fed from one database pool
/// and one HTTP client.
pub async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    let dsn = normalize_postgres_dsn(&config.database.url);
    let storage = Storage::connect(
        &dsn,
        config.database.min_connections,
        config.database.max_connections,
    )
    .await
    .context("connecting to postgres")?;
    storage.run_migrations().await?;

    if config.raw_store.mongo_uri.is_some() {
        info!("external raw-store DSN configured; this build persists raw pages in postgres");
    }

    let pool = storage.pool().clone();
    let storage = Arc::new(storage);
    let frontier = Arc::new(Frontier::new(
        pool.clone(),
        FrontierOptions {
            max_depth: config.crawler.max_depth,
            max_pages: config.crawler.max_pages,
        },
    ));
    let policy = Arc::new(PolicyController::new(pool.clone()));
    let client = jooya_fetch::build_client(&config.fetch)?;
    let robots = Arc::new(RobotsCache::new(
        client.clone(),
        config.fetch.user_agent.clone(),
        Duration::from_secs(config.politeness.robots_ttl_hours * 3600),
    ));
    let raw_store: Arc<dyn RawStore> =
        Arc::new(PgRawStore::new(pool, config.fetch.max_saved_html_bytes));
    let metrics = Arc::new(Metrics::new()?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics_handle = tokio::spawn(jooya_metrics::serve(
        METRICS_PORT,
        Arc::clone(&metrics),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = {
        let frontier = Arc::clone(&frontier);
        let metrics = Arc::clone(&metrics);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(QUEUE_SAMPLE_INTERVAL) => {
                        match frontier.count_scheduled().await {
                            Ok(count) => metrics.queue_pending.set(count),
                            Err(e) => error!(error = %e, "queue monitor error"),
                        }
                    }
                }
            }
        })
    };

    let mut worker_handles = Vec::with_capacity(config.crawler.workers);
    for worker_id in 0..config.crawler.workers {
        let worker = Worker {
            worker_id,
            config: Arc::clone(&config),
            client: client.clone(),
            frontier: Arc::clone(&frontier),
            storage: Arc::clone(&storage),
            raw_store: Arc::clone(&raw_store),
            robots: Arc::clone(&robots),
            policy: Arc::clone(&policy),
            metrics: Arc::clone(&metrics),
        };
        worker_handles.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }
    info!(workers = config.crawler.workers, "crawler started");

    shutdown_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = monitor_handle.await;
    if let Ok(Err(e)) = metrics_handle.await {
        error!(error = %e, "metrics server error");
    }

    storage.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
