use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use feedsync_core::FeedSource;
use feedsync_storage::{SqliteStore, Store};
use feedsync_sync::{SyncConfig, SyncEngine, SyncError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Fetch RSS feeds and keep their posts in a local database")]
struct Cli {
    /// YAML file overriding settings taken from the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register a feed if it is new, otherwise refresh it.
    Sync {
        url: String,
        /// Ignore the minimum refresh interval.
        #[arg(long)]
        force: bool,
    },
    /// Refresh an already registered feed.
    Refresh {
        url: String,
        #[arg(long)]
        force: bool,
    },
    /// Print stored post, enclosure and category counts for a feed.
    Summary { url: String },
    /// Create the database schema.
    Migrate,
}

fn print_feed(feed: &FeedSource) {
    println!(
        "{} ({}) last_refresh={} last_error={}",
        feed.name,
        feed.url,
        feed.last_refresh
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
        feed.last_error.map(|e| e.kind()).unwrap_or("none"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let mut config = SyncConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.apply_file(path)?;
    }

    match cli.command {
        Commands::Migrate => {
            SqliteStore::open(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("schema ready: {}", config.database_url);
        }
        Commands::Sync { url, force } => {
            let engine = SyncEngine::connect(config).await?;
            let feed = engine.sync_feed(&url, force).await?;
            print_feed(&feed);
        }
        Commands::Refresh { url, force } => {
            let engine = SyncEngine::connect(config).await?;
            let feed = engine
                .store()
                .get_feed(url.trim())
                .await?
                .ok_or_else(|| SyncError::UnknownFeed(url.clone()))?;
            let feed = engine.refresh_feed(&feed, force).await?;
            print_feed(&feed);
        }
        Commands::Summary { url } => {
            let engine = SyncEngine::connect(config).await?;
            let (feed, summary) = engine.feed_summary(&url).await?;
            print_feed(&feed);
            println!(
                "posts={} enclosures={} categories={}",
                summary.posts, summary.enclosures, summary.categories
            );
        }
    }

    Ok(())
}
