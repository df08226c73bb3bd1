//! dank CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use dank::config::load_settings;
use dank::services::run_scrape;

/// Archive X timelines and RSS/Atom feeds.
#[derive(Parser)]
#[command(name = "dank")]
#[command(about = "Content acquisition pipeline for timelines and feeds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every configured source once
    Scrape {
        /// Config file (defaults to discovered dank config)
        #[arg(long, env = "DANK_CONFIG")]
        config: Option<PathBuf>,

        /// Run the browser without a window
        #[arg(long, env = "DANK_HEADLESS")]
        headless: bool,

        /// Records per storage flush (values below 1 mean 1)
        #[arg(long, env = "DANK_BATCH_SIZE", allow_negative_numbers = true)]
        batch_size: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            config,
            headless,
            batch_size,
        } => {
            let mut settings = load_settings(config.as_deref())
                .await
                .context("Failed to load configuration")?;
            settings.headless = headless;
            if let Some(size) = batch_size {
                settings.batch_size = usize::try_from(size.max(1)).unwrap_or(1);
            }

            dank::logging::init(&settings.log_level, settings.log_file.as_deref())
                .context("Failed to initialize logging")?;
            info!("dank {} starting", env!("CARGO_PKG_VERSION"));

            let report = run_scrape(&settings).await.context("Scrape failed")?;
            for outcome in &report.sources {
                match &outcome.error {
                    Some(e) => println!("{}: failed ({})", outcome.source, e),
                    None => println!(
                        "{}: {} posts, {} assets in {} batches",
                        outcome.source,
                        outcome.summary.posts,
                        outcome.summary.assets,
                        outcome.summary.batches
                    ),
                }
            }
            for (domain, counts) in &report.counts {
                println!(
                    "{}: stored {} posts, {} assets ({} downloaded)",
                    domain, counts.posts, counts.assets, counts.assets_downloaded
                );
            }

            if let Some(e) = &report.error {
                error!("Run failed: {}", e);
                eprintln!("Run failed: {}", e);
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
