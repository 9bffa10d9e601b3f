//! Tomecrawl main entry point
//!
//! This is the command-line interface for the Tomecrawl catalog harvester.

use anyhow::Context;
use clap::{ArgGroup, Parser};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tomecrawl::config::{load_config_with_hash, Config};
use tomecrawl::crawler::{build_pipeline, BenchmarkReport, DEFAULT_SAMPLE_SIZE};
use tomecrawl::driver::{CycleDriver, Locked, SysinfoLiveness};
use tomecrawl::output::{print_latest_report, ProgressReporter};
use tomecrawl::storage::DataStore;
use tracing_subscriber::EnvFilter;

/// Tomecrawl: a resumable catalog harvester
///
/// Tomecrawl walks a paginated catalog, fetches each work's detail page and
/// chapters, and writes them as JSON records. It adapts its parallelism to
/// host load and resumes from per-target cursors after restarts.
#[derive(Parser, Debug)]
#[command(name = "tomecrawl")]
#[command(version = "1.0.0")]
#[command(about = "A resumable catalog harvester", long_about = None)]
#[command(group(ArgGroup::new("targeted").args(["retry_failed", "benchmark"]).multiple(false)))]
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

    /// Run a single cycle and exit
    #[arg(long, conflicts_with_all = ["retry_failed", "verify", "stats", "benchmark"])]
    once: bool,

    /// Re-fetch previously failed items and exit
    #[arg(long, conflicts_with_all = ["once", "verify", "stats", "benchmark"])]
    retry_failed: bool,

    /// Limit --retry-failed or --benchmark to one target
    #[arg(long, value_name = "SLUG", requires = "targeted")]
    target: Option<String>,

    /// Reconcile progress with the item files on disk and exit
    #[arg(long, conflicts_with_all = ["once", "retry_failed", "stats", "benchmark"])]
    verify: bool,

    /// With --verify, report without writing or fetching anything
    #[arg(long, requires = "verify")]
    dry_run: bool,

    /// Print the latest session statistics and exit
    #[arg(long, conflicts_with_all = ["once", "retry_failed", "verify", "benchmark"])]
    stats: bool,

    /// Measure item fetches at increasing batch sizes and print the best one
    #[arg(long, conflicts_with_all = ["once", "retry_failed", "verify", "stats"])]
    benchmark: bool,

    /// Number of items fetched per batch size with --benchmark
    #[arg(long, value_name = "N", default_value_t = DEFAULT_SAMPLE_SIZE, requires = "benchmark")]
    samples: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Bars are drawn on stderr, so logs go through the same display
    let progress = Arc::new(ProgressReporter::new(!cli.quiet));
    setup_logging(cli.verbose, cli.quiet, &progress);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, _config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.stats {
        return handle_stats(&config).await;
    }

    let cancel = CancellationToken::new();
    let signals = cancel.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => tracing::info!("Termination signal received, finishing the current batch"),
            Err(e) => tracing::error!("Signal handling unavailable: {:#}", e),
        }
        signals.cancel();
    });

    let config = Arc::new(config);
    let pipeline = Arc::new(build_pipeline(Arc::clone(&config), progress, cancel.clone())?);
    let driver = CycleDriver::new(pipeline, Arc::new(SysinfoLiveness), cancel.clone());

    if cli.retry_failed {
        with_grace(&driver, &cancel, handle_retry(&driver, cli.target.as_deref())).await
    } else if cli.benchmark {
        with_grace(&driver, &cancel, handle_benchmark(&driver, cli.target.as_deref(), cli.samples)).await
    } else if cli.verify {
        with_grace(&driver, &cancel, handle_verify(&driver, cli.dry_run)).await
    } else if cli.once {
        with_grace(&driver, &cancel, handle_once(&driver)).await
    } else {
        with_grace(&driver, &cancel, handle_forever(&driver)).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool, progress: &ProgressReporter) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tomecrawl=info,warn"),
            1 => EnvFilter::new("tomecrawl=debug,info"),
            2 => EnvFilter::new("tomecrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);

    if progress.is_visible() {
        builder.with_writer(progress.log_writer()).init();
    } else {
        builder.init();
    }
}

/// Resolves on SIGINT, SIGTERM or SIGHUP
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut hup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        tokio::select! {
            res = &mut ctrl_c => res.context("failed to listen for Ctrl-C")?,
            _ = term.recv() => {},
            _ = hup.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl-C")
    }
}

/// Runs `work` to completion, or for at most `shutdown-grace` once cancelled
///
/// When the grace period runs out the stats are flushed here; dropping `work`
/// releases the run lock.
async fn with_grace<F>(
    driver: &CycleDriver,
    cancel: &CancellationToken,
    work: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = Result<(), Box<dyn std::error::Error>>>,
{
    tokio::pin!(work);

    tokio::select! {
        res = &mut work => return res,
        _ = cancel.cancelled() => {}
    }

    let grace = driver.pipeline().config().driver.shutdown_grace();
    tracing::info!("Shutting down, waiting up to {:?} for in-flight work", grace);
    match tokio::time::timeout(grace, &mut work).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!("Grace period elapsed, exiting with work in flight");
            let pipeline = driver.pipeline();
            if let Err(e) = pipeline.parts().stats.save(pipeline.store()).await {
                tracing::warn!("Failed to save session stats: {}", e);
            }
            Ok(())
        }
    }
}

/// Handles the default mode: cycles on a fixed period until a signal
async fn handle_forever(driver: &CycleDriver) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        "Starting cycle driver (period {:?})",
        driver.pipeline().config().driver.cycle_period()
    );
    driver.run_forever().await?;
    Ok(())
}

/// Handles the --once mode: a single locked cycle
async fn handle_once(driver: &CycleDriver) -> Result<(), Box<dyn std::error::Error>> {
    match driver.run_cycle_once().await {
        Ok(Locked::Ran(report)) => {
            tracing::info!("Cycle completed with {} phase errors", report.errors.len());
            Ok(())
        }
        Ok(Locked::Contended { pid, since }) => {
            println!("Another instance (pid {}) has been running since {}", pid, since);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Cycle failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handles the --retry-failed mode
async fn handle_retry(
    driver: &CycleDriver,
    target: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = driver
        .run_locked("retry-failed", |pipeline| async move {
            pipeline.retry_failed(target).await
        })
        .await?;

    let summary = match outcome {
        Locked::Ran(summary) => summary,
        Locked::Contended { pid, since } => {
            println!("Another instance (pid {}) has been running since {}", pid, since);
            return Ok(());
        }
    };

    println!("=== Retry Summary ===\n");
    for run in &summary.targets {
        println!(
            "  {}: {} recovered, {} still failing",
            run.slug,
            run.stored,
            run.pending_failures.len()
        );
    }
    println!("\nTotal failed items: {}", summary.total_failed);
    println!("Recovered: {}", summary.succeeded);
    println!("Remaining: {}", summary.remaining);

    Ok(())
}

/// Handles the --verify mode
async fn handle_verify(driver: &CycleDriver, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = driver
        .run_locked("verify", |pipeline| async move { pipeline.verify(dry_run).await })
        .await?;

    let summary = match outcome {
        Locked::Ran(summary) => summary,
        Locked::Contended { pid, since } => {
            println!("Another instance (pid {}) has been running since {}", pid, since);
            return Ok(());
        }
    };

    println!(
        "=== Verification Report{} ===\n",
        if dry_run { " (dry run)" } else { "" }
    );
    println!("Targets checked: {}", summary.targets.len());

    println!("\nCursor corrections ({}):", summary.cursor_corrections());
    for t in summary.targets.iter().filter(|t| t.initial.cursor_corrected()) {
        println!(
            "  - {}: {} -> {}",
            t.initial.slug, t.initial.previous_scraped, t.initial.corrected_scraped
        );
    }

    println!("\nMissing items ({}):", summary.gaps());
    for t in summary.targets.iter().filter(|t| !t.initial.gaps.is_empty()) {
        let recovered = t.refetch.as_ref().map(|r| r.stored).unwrap_or(0);
        println!(
            "  - {}: {:?} ({} re-fetched)",
            t.initial.slug, t.initial.gaps, recovered
        );
    }

    println!("\nMissing item index ({}):", summary.missing_item_index());
    for t in summary.targets.iter().filter(|t| t.initial.item_index_missing) {
        println!("  - {}", t.initial.slug);
    }

    println!("\nMissing detail record ({}):", summary.missing_detail.len());
    for slug in &summary.missing_detail {
        println!("  - {}", slug);
    }

    if summary.errors > 0 {
        println!("\n{} targets could not be verified, see the log", summary.errors);
    }

    Ok(())
}

/// Handles the --benchmark mode
///
/// Nothing is written to the data directory, so the run lock is not taken.
async fn handle_benchmark(
    driver: &CycleDriver,
    target: Option<&str>,
    samples: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = driver.pipeline().benchmark(target, samples).await?;
    print_benchmark(&report);
    Ok(())
}

fn print_benchmark(report: &BenchmarkReport) {
    println!("=== Concurrency Benchmark ===\n");
    println!("Target: {} ({} items per batch size)\n", report.slug, report.sample_size);
    println!("{:>6} {:>9} {:>9} {:>12} {:>10} {:>8}", "batch", "success", "errors", "avg latency", "total", "score");
    for level in &report.levels {
        println!(
            "{:>6} {:>8.1}% {:>8.1}% {:>10}ms {:>9.2}s {:>8.3}",
            level.concurrency,
            level.success_rate(),
            level.error_rate(),
            level.avg_latency.as_millis(),
            level.elapsed.as_secs_f64(),
            level.score()
        );
    }

    match report.recommended {
        Some(k) => println!("\nRecommended max-concurrency: {}", k),
        None => println!("\nNo batch size completed, nothing to recommend"),
    }
}

/// Handles the --stats mode: prints the latest session
async fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Data directory: {}\n", config.output.data_dir.display());
    let store = DataStore::new(config.output.data_dir.clone());
    print_latest_report(&store).await?;
    Ok(())
}
