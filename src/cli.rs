use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jooya-crawler", about = "Polite frontier-driven web crawler")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool against the shared frontier
    Crawl {
        /// Override the configured worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show frontier and storage counts
    Status,
}
