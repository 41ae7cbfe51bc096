mod cli;
mod commands;
mod supervisor;
mod worker;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use jooya_core::config::AppConfig;

use crate::cli::{Cli, Commands};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;
    apply_env_overrides(&mut config);

    match cli.command {
        Commands::Crawl { workers } => {
            if let Some(workers) = workers {
                config.crawler.workers = workers;
            }
            supervisor::run(config).await?;
        }
        Commands::Status => commands::status::run(config).await?,
    }

    Ok(())
}

/// Environment wins over the config file so deployments can keep a single
/// env file shared with the other services on the same database.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("RADAR_DATABASE_URL") {
        config.database.url = v;
    } else if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database.url = v;
    }
    if let Ok(v) = std::env::var("MONGO_URI").or_else(|_| std::env::var("MONGO_URL")) {
        config.raw_store.mongo_uri = Some(v);
    }
    if let Ok(v) = std::env::var("MONGO_DB") {
        config.raw_store.mongo_db = Some(v);
    }
    if let Ok(v) = std::env::var("WORKERS") {
        match v.parse::<usize>() {
            Ok(n) if n > 0 => config.crawler.workers = n,
            _ => warn!(value = %v, "invalid WORKERS, keeping the configured count"),
        }
    }
    if let Ok(v) = std::env::var("MAX_DEPTH") {
        match v.parse::<i32>() {
            Ok(n) => config.crawler.max_depth = Some(n),
            Err(_) => warn!(value = %v, "invalid MAX_DEPTH, keeping the configured limit"),
        }
    }
    if let Ok(v) = std::env::var("MAX_PAGES") {
        if let Ok(n) = v.parse::<u64>() {
            config.crawler.max_pages = Some(n);
        }
    }
    if let Ok(v) = std::env::var("MAX_DOWNLOAD_BYTES") {
        if let Ok(n) = v.parse::<usize>() {
            config.fetch.max_download_bytes = n;
        }
    }
    if let Ok(v) = std::env::var("MAX_SAVED_HTML_BYTES") {
        if let Ok(n) = v.parse::<usize>() {
            config.fetch.max_saved_html_bytes = n;
        }
    }
    if let Ok(v) = std::env::var("CRAWLER_USER_AGENT") {
        if !v.is_empty() {
            config.fetch.user_agent = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns all env mutation; the other tests in this binary leave
    // the environment alone, so there is no parallel interference.
    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("RADAR_DATABASE_URL", "postgresql+psycopg2://u:p@db:5432/radar");
        std::env::set_var("WORKERS", "7");
        std::env::set_var("MAX_DEPTH", "4");
        std::env::set_var("MAX_DOWNLOAD_BYTES", "1000000");
        std::env::set_var("CRAWLER_USER_AGENT", "TestBot/2.0");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);

        assert_eq!(config.database.url, "postgresql+psycopg2://u:p@db:5432/radar");
        assert_eq!(config.crawler.workers, 7);
        assert_eq!(config.crawler.max_depth, Some(4));
        assert_eq!(config.fetch.max_download_bytes, 1_000_000);
        assert_eq!(config.fetch.user_agent, "TestBot/2.0");

        for key in [
            "RADAR_DATABASE_URL",
            "WORKERS",
            "MAX_DEPTH",
            "MAX_DOWNLOAD_BYTES",
            "CRAWLER_USER_AGENT",
        ] {
            std::env::remove_var(key);
        }
    }
}
