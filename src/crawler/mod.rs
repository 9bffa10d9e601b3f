//! Crawler module for fetching and processing catalog pages
//!
//! This module contains the core harvesting logic, including:
//! - HTTP fetching behind the `PageFetcher` seam
//! - Payload extraction behind the `Extractor` seam
//! - Failure classification and retry with per-class backoff
//! - Batch scheduling with adaptive concurrency
//! - The pipeline passes and repair commands
//! - The concurrency benchmark

mod benchmark;
mod coordinator;
mod fetcher;
mod parser;
mod retry;
mod scheduler;

pub use benchmark::{
    levels_for, recommend, run_level, BenchmarkReport, LevelResult, BENCHMARK_LEVELS,
    DEFAULT_SAMPLE_SIZE,
};
pub use coordinator::{
    Collaborators, DetailSummary, ItemsSummary, ListingSummary, Pipeline, RetrySummary,
    TargetRunSummary, TargetVerification, VerifySummary,
};
pub use fetcher::{build_http_client, FetchError, HttpFetcher, PageFetcher, RawDocument};
pub use parser::{Extraction, Extractor, NextDataExtractor};
pub use retry::{classify, with_retry, ClassifiedError, ErrorClass, RetryPolicy};
pub use scheduler::{
    assess_batch, pause, BatchVerdict, ChunkScheduler, ConcurrencyController, JobOutcome,
    ThrottleDecision,
};

use crate::config::Config;
use crate::monitor::{ResourceMonitor, SysinfoSource};
use crate::output::{build_notifier, Notifier, ProgressReporter, StatsCollector};
use crate::storage::DataStore;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wires the production collaborators of a pipeline
///
/// The HTTP client is shared between the fetcher and the notifier. The
/// returned monitor is not started.
pub fn build_pipeline(
    config: Arc<Config>,
    progress: Arc<ProgressReporter>,
    cancel: CancellationToken,
) -> Result<Pipeline> {
    let client = build_http_client(&config.source)?;
    let stats = Arc::new(StatsCollector::new());
    let notifier: Arc<dyn Notifier> = build_notifier(config.notify.as_ref(), client.clone());
    let monitor = Arc::new(ResourceMonitor::new(
        Arc::new(SysinfoSource::new()),
        config.monitor.clone(),
        Arc::clone(&notifier),
        Arc::clone(&stats),
    ));

    let parts = Collaborators {
        fetcher: Arc::new(HttpFetcher::with_client(client)),
        extractor: Arc::new(NextDataExtractor::new()),
        monitor,
        notifier,
        stats,
        progress,
    };
    let store = DataStore::new(config.output.data_dir.clone());
    Pipeline::new(config, store, parts, cancel)
}
