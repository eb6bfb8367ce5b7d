//! Vodsweep main entry point
//!
//! This is the command-line interface for the Vodsweep crawl engine.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vodsweep::config::{load_config_with_hash, Config, MergeConfig};
use vodsweep::crawler::controls::{spawn_signal_handler, spawn_stdin_reader};
use vodsweep::crawler::{parse_id_ranges, run_job, Controls, JobMode, JobOptions};
use vodsweep::output::{load_statistics, print_statistics};
use vodsweep::storage::open_store;

/// Vodsweep: a resumable, rate-limited crawler for paginated JSON APIs
///
/// Vodsweep walks every configured stream to exhaustion, checkpointing as it
/// goes. An interrupted run picks up where it stopped. While it runs, type
/// `exit` to drain and stop, or `concurrency streams <n>` to change how many
/// streams are in flight (0 pauses).
#[derive(Parser, Debug)]
#[command(name = "vodsweep")]
#[command(version)]
#[command(about = "A resumable paginated API crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start the job over, discarding saved checkpoints
    #[arg(long)]
    fresh: bool,

    /// Run the [scan] ID ranges instead of the discovery pipeline
    #[arg(long)]
    scan: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show the job's saved progress and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let mode = if cli.scan {
        JobMode::Scan
    } else {
        JobMode::Pipeline
    };

    if cli.dry_run {
        handle_dry_run(&config, mode)?;
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_crawl(config, config_hash, mode, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("vodsweep=info,warn"),
            1 => EnvFilter::new("vodsweep=debug,info"),
            2 => EnvFilter::new("vodsweep=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn describe_merge(merge: &MergeConfig) -> String {
    match merge {
        MergeConfig::Flat { field } => format!("append '{}'", field),
        MergeConfig::ById { fields, key } => {
            format!("merge {} by '{}'", fields.join(", "), key)
        }
    }
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config, mode: JobMode) -> anyhow::Result<()> {
    println!("=== Vodsweep Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Concurrency: {} streams", config.crawler.concurrency);
    println!(
        "  Checkpoint every: {} pages / {}s",
        config.crawler.checkpoint_every_pages, config.crawler.flush_interval_secs
    );
    println!(
        "  Request timeout: {}s",
        config.crawler.request_timeout_secs
    );
    println!(
        "  Retries: {} (transient {}ms, rate limited {}ms)",
        config.retry.max_retries, config.retry.transient_delay_ms, config.retry.rate_limited_delay_ms
    );

    println!("\nUser Agent:");
    println!("  Name: {}", config.user_agent.crawler_name);
    println!("  Version: {}", config.user_agent.crawler_version);
    println!("  Contact URL: {}", config.user_agent.contact_url);
    println!("  Contact Email: {}", config.user_agent.contact_email);

    println!("\nOutput:");
    println!("  Checkpoint dir: {}", config.output.checkpoint_dir);
    println!("  Job: {}", config.output.job);

    println!("\nEndpoint Classes ({}):", config.endpoints.len());
    for endpoint in &config.endpoints {
        println!(
            "  - {} every {}ms: {}",
            endpoint.name, endpoint.interval_ms, endpoint.prefix
        );
    }
    println!(
        "  - default every {}ms",
        config.crawler.default_interval_ms
    );

    match mode {
        JobMode::Pipeline => {
            println!("\nDiscovery Streams ({}):", config.streams.len());
            for stream in &config.streams {
                println!(
                    "  - {} ({:?}, {}): {}",
                    stream.name,
                    stream.pagination,
                    describe_merge(&stream.merge),
                    stream.url
                );
            }

            match &config.entities {
                Some(entities) => {
                    let source = entities
                        .source_set
                        .as_deref()
                        .map(|set| format!("set '{}'", set))
                        .or_else(|| entities.source_file.as_ref().map(|f| format!("file {}", f)))
                        .unwrap_or_default();
                    println!(
                        "\nEntity Streams ({}, per ID from {}):",
                        entities.streams.len(),
                        source
                    );
                    for stream in &entities.streams {
                        println!("  - {}: {}", stream.name, stream.url);
                    }
                }
                None => println!("\nNo [entities] section"),
            }
        }
        JobMode::Scan => {
            let Some(scan) = &config.scan else {
                anyhow::bail!("--scan needs a [scan] section in the configuration");
            };
            let ranges = parse_id_ranges(&scan.ranges)?;
            let pages: u64 = ranges.iter().map(|r| r.pages(scan.page_size)).sum();
            println!("\nScan ({} ranges, {} pages of {} IDs):", ranges.len(), pages, scan.page_size);
            for range in &ranges {
                println!("  - {}", range);
            }
        }
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows the job's saved progress
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Checkpoint dir: {}\n", config.output.checkpoint_dir);

    let store = open_store(Path::new(&config.output.checkpoint_dir))
        .context("Failed to open checkpoint directory")?;
    let stats = load_statistics(&store, config).context("Failed to read checkpoints")?;

    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: Config,
    config_hash: String,
    mode: JobMode,
    fresh: bool,
) -> anyhow::Result<()> {
    let controls = Arc::new(Controls::new(config.crawler.concurrency as usize));
    spawn_stdin_reader(Arc::clone(&controls));
    let _signals = spawn_signal_handler(Arc::clone(&controls));

    let summary = run_job(&config, &config_hash, JobOptions { mode, fresh }, &controls)
        .await
        .with_context(|| format!("Job {} failed", config.output.job))?;

    for (phase, report) in &summary.phases {
        tracing::info!(
            "Phase {}: {} pages, {} items, {} units ({} skipped), {} failed streams, {} stopped early, {:.1}s",
            phase,
            report.pages,
            report.items,
            report.units_completed,
            report.units_skipped,
            report.streams_failed,
            report.streams_stopped,
            report.elapsed.as_secs_f64()
        );
    }

    if summary.cancelled {
        tracing::info!("Stopped early; run again to resume");
    } else {
        tracing::info!("Crawl completed successfully");
    }

    Ok(())
}
