use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod downloader;
mod fetch;
mod manifest;
mod progress;
mod recipe;
mod utils;

use downloader::pool::RetryPolicy;
use downloader::{DownloadConfig, Orchestrator, resolver, verify_tree};
use fetch::HttpChunkFetcher;
use progress::ConsoleSink;

#[derive(Parser)]
#[command(name = "depotsync")]
#[command(about = "Manifest-driven depot downloader with verify and repair")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download or repair every depot in a recipe into one target tree
    Download {
        #[arg(long, help = "Recipe file with ordered depot manifests")]
        recipe: PathBuf,
        #[arg(long, help = "Target directory")]
        dest: PathBuf,
        #[arg(short, long, default_value_t = 8, help = "Concurrent workers")]
        concurrency: usize,
        #[arg(long, default_value_t = 64, help = "Maximum queued fetch tasks")]
        queue_depth: usize,
        #[arg(long, default_value_t = 3, help = "Fetch attempts per chunk")]
        retries: u32,
        #[arg(long, help = "Stop the whole run on the first failed file")]
        fail_fast: bool,
        #[arg(long, help = "Run an extra repair pass over failed chunks")]
        repair: bool,
        #[arg(
            short,
            long,
            help = "Chunk source base URL, repeatable (overrides the recipe)"
        )]
        source: Vec<String>,
    },
    /// Check an existing tree against a recipe without downloading
    Verify {
        #[arg(long, help = "Recipe file with ordered depot manifests")]
        recipe: PathBuf,
        #[arg(long, help = "Target directory")]
        dest: PathBuf,
        #[arg(short, long, default_value_t = 8, help = "Concurrent workers")]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Download {
            recipe,
            dest,
            concurrency,
            queue_depth,
            retries,
            fail_fast,
            repair,
            source,
        }) => {
            let recipe = recipe::load(&recipe)?;
            let sources = if source.is_empty() {
                recipe.sources.clone()
            } else {
                source
            };
            if sources.is_empty() {
                return Err("no chunk source configured: pass --source or add \"sources\" to the recipe".into());
            }

            let mut config = DownloadConfig::new(&dest);
            config.workers = concurrency;
            config.queue_depth = queue_depth;
            config.retry = RetryPolicy {
                max_attempts: retries.max(1),
                ..RetryPolicy::default()
            };
            config.fail_fast = fail_fast;
            config.repair = repair;

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?;
            let fetcher = Arc::new(HttpChunkFetcher::with_client(client, sources));
            let orchestrator = Orchestrator::new(config, fetcher, Arc::new(ConsoleSink::new()));

            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupted, stopping workers...");
                    cancel.cancel();
                }
            });

            let summary = orchestrator.run(&recipe.depots).await?;

            for report in &summary.depots {
                println!(
                    "depot {}: {} ({} files, {} superseded, {} chunks / {} bytes fetched)",
                    report.depot_id,
                    report.state,
                    report.files_completed,
                    report.files_superseded,
                    report.chunks_fetched,
                    report.bytes_fetched
                );
                for failure in &report.failures {
                    println!("  {}", failure);
                }
            }
            if let Some(path) = resolver::write_report(&dest, &summary.overwrites).await? {
                println!("Overwrite log saved to {}", path.display());
            }

            if summary.cancelled {
                return Err("run cancelled before completion".into());
            }
            summary.into_result()?;
            println!("All depots downloaded and verified.");
        }

        Some(Commands::Verify {
            recipe,
            dest,
            concurrency,
        }) => {
            let recipe = recipe::load(&recipe)?;
            let mut config = DownloadConfig::new(&dest);
            config.workers = concurrency;

            let report = verify_tree(&config, &recipe.depots).await?;

            println!("{} file(s) fully verified.", report.files_ok);
            if report.is_clean() {
                println!("Tree is complete.");
            } else {
                for file in &report.needs_repair {
                    println!(
                        "depot {}: {} needs {} chunk(s), {} bytes",
                        file.depot_id,
                        file.path.display(),
                        file.missing_chunks,
                        file.bytes_needed
                    );
                }
                return Err(format!(
                    "{} file(s) need repair ({} bytes); run the download command to fix them",
                    report.needs_repair.len(),
                    report.bytes_needed()
                )
                .into());
            }
        }

        None => {
            println!("Use --help for available commands");
        }
    }

    Ok(())
}
