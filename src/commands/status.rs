use anyhow::Result;

use jooya_core::config::{normalize_postgres_dsn, AppConfig};
use jooya_storage::Storage;

/// Operator snapshot: frontier state breakdown plus table counts.
pub async fn run(config: AppConfig) -> Result<()> {
    let dsn = normalize_postgres_dsn(&config.database.url);
    let storage = Storage::connect(
        &dsn,
        config.database.min_connections,
        config.database.max_connections,
    )
    .await?;

    println!("frontier:");
    for (status, count) in storage.frontier_status_counts().await? {
        println!("  {status:<12} {count}");
    }
    println!("pages:  {}", storage.page_count().await?);
    println!("links:  {}", storage.link_count().await?);
    println!("errors: {}", storage.error_count().await?);

    Ok(())
}
