//! Concurrency benchmark
//!
//! Fetches a fixed sample of one target's items at increasing batch sizes and
//! scores each size by reliability per unit of latency. Nothing is persisted.

use crate::crawler::retry::{with_retry, RetryPolicy};
use crate::crawler::scheduler::{pause, ChunkScheduler};
use crate::crawler::{Extraction, Extractor, PageFetcher};
use crate::state::FetchJob;
use futures_util::future::join_all;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Batch sizes tried, smallest first
pub const BENCHMARK_LEVELS: &[usize] = &[1, 3, 5, 8, 10, 15, 20, 25, 30, 40, 50, 60, 70, 80, 90, 100];

pub const DEFAULT_SAMPLE_SIZE: u32 = 20;

/// Measurements for one batch size
#[derive(Debug, Clone, PartialEq)]
pub struct LevelResult {
    pub concurrency: usize,
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Wall time including the delays between batches
    pub elapsed: Duration,
    /// Time spent inside batches divided by the number of requests
    pub avg_latency: Duration,
}

impl LevelResult {
    pub fn success_rate(&self) -> f64 {
        percent(self.succeeded, self.requests)
    }

    pub fn error_rate(&self) -> f64 {
        percent(self.failed, self.requests)
    }

    /// Net success rate per millisecond of average latency
    pub fn score(&self) -> f64 {
        let latency_ms = (self.avg_latency.as_secs_f64() * 1000.0).max(0.001);
        (self.success_rate() - self.error_rate()) / latency_ms
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Outcome of a benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub slug: String,
    pub sample_size: usize,
    pub levels: Vec<LevelResult>,
    pub recommended: Option<usize>,
}

/// Sizes worth trying for `sample_size` jobs
///
/// A batch larger than the sample measures the same thing as one equal to
/// it, so those are left out.
pub fn levels_for(sample_size: usize) -> Vec<usize> {
    BENCHMARK_LEVELS
        .iter()
        .copied()
        .filter(|k| *k <= sample_size.max(1))
        .collect()
}

/// Highest-scoring batch size; the smaller one wins a tie
pub fn recommend(levels: &[LevelResult]) -> Option<usize> {
    let mut best: Option<&LevelResult> = None;
    for level in levels {
        match best {
            Some(b) if level.score() <= b.score() => {}
            _ => best = Some(level),
        }
    }
    best.map(|l| l.concurrency)
}

/// Runs every job once in batches of `k`, without persisting anything
pub async fn run_level(
    fetcher: &dyn PageFetcher,
    extractor: &dyn Extractor,
    policy: &RetryPolicy,
    jobs: &[FetchJob],
    k: usize,
    batch_delay: Duration,
    cancel: &CancellationToken,
) -> LevelResult {
    let started = Instant::now();
    let mut chunks = ChunkScheduler::new(jobs.iter());
    let mut in_batches = Duration::ZERO;
    let mut result = LevelResult {
        concurrency: k,
        requests: 0,
        succeeded: 0,
        failed: 0,
        elapsed: Duration::ZERO,
        avg_latency: Duration::ZERO,
    };

    while let Some(batch) = chunks.plan_next(k) {
        if cancel.is_cancelled() {
            break;
        }

        let batch_started = Instant::now();
        let outcomes = join_all(batch.iter().map(|job| {
            let url = job.url.as_str();
            with_retry(policy, url, move || async move {
                let doc = fetcher.fetch_page(url).await?;
                extractor.extract_item(&doc)
            })
        }))
        .await;
        in_batches += batch_started.elapsed();

        for outcome in outcomes {
            result.requests += 1;
            match outcome {
                Ok(Extraction::Record(_)) => result.succeeded += 1,
                Ok(Extraction::Skip(_)) | Err(_) => result.failed += 1,
            }
        }

        if !chunks.is_empty() {
            pause(batch_delay, cancel).await;
        }
    }

    result.elapsed = started.elapsed();
    if result.requests > 0 {
        result.avg_latency = in_batches / result.requests as u32;
    }
    result
}
