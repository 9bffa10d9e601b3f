//! Batch scheduling and adaptive concurrency
//!
//! This module handles:
//! - Partitioning an ordered backlog into consecutive batches of size *k*
//! - Picking *k* before each batch from live resource metrics
//! - Judging a settled batch for target-wide (structural) failure
//! - Cancellable pauses between batches
//!
//! *k* always stays within `[floor, ceiling]`. It shrinks fast when the host
//! is over the high-water mark and grows one step at a time when the host is
//! comfortably under the low-water mark.

use crate::config::{CrawlerConfig, MonitorConfig};
use crate::crawler::{ClassifiedError, ErrorClass};
use crate::monitor::ResourceMetrics;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ratio applied to *k* when the host is overloaded
const SHRINK_RATIO: f64 = 0.7;

/// What the controller did before a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Shrunk to `to`; wait `cooldown` before dispatching
    Shrink {
        from: usize,
        to: usize,
        cooldown: Duration,
    },
    Grow {
        from: usize,
        to: usize,
    },
    Hold,
}

/// Picks the concurrency level of the next batch
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    floor: usize,
    ceiling: usize,
    current: usize,
    high_water: f32,
    low_water: f32,
    cooldown: Duration,
}

impl ConcurrencyController {
    /// Creates a controller starting at its ceiling
    ///
    /// The ceiling is raised to the floor if it would sit below it.
    pub fn new(floor: usize, ceiling: usize, high_water: f32, low_water: f32, cooldown: Duration) -> Self {
        let floor = floor.max(1);
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: ceiling,
            high_water,
            low_water,
            cooldown,
        }
    }

    /// Builds a controller whose ceiling is the suggested level clamped to
    /// `[min_concurrency, max_concurrency]`
    pub fn from_config(crawler: &CrawlerConfig, monitor: &MonitorConfig, suggested: usize) -> Self {
        let ceiling = suggested.clamp(crawler.min_concurrency, crawler.max_concurrency);
        Self::new(
            crawler.min_concurrency,
            ceiling,
            monitor.high_water,
            monitor.low_water,
            crawler.batch_delay() * 2,
        )
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Applies the hysteresis rule to the latest metrics
    pub fn adjust(&mut self, metrics: &ResourceMetrics) -> ThrottleDecision {
        let from = self.current;

        if metrics.exceeds(self.high_water) {
            let shrunk = ((from as f64) * SHRINK_RATIO).floor() as usize;
            self.current = shrunk.max(self.floor);
            return ThrottleDecision::Shrink {
                from,
                to: self.current,
                cooldown: self.cooldown,
            };
        }

        if metrics.below(self.low_water) && from < self.ceiling {
            self.current = from + 1;
            return ThrottleDecision::Grow {
                from,
                to: self.current,
            };
        }

        ThrottleDecision::Hold
    }
}

/// Ordered backlog consumed batch by batch
#[derive(Debug, Clone)]
pub struct ChunkScheduler<J> {
    backlog: VecDeque<J>,
}

impl<J> ChunkScheduler<J> {
    pub fn new(jobs: impl IntoIterator<Item = J>) -> Self {
        Self {
            backlog: jobs.into_iter().collect(),
        }
    }

    /// Takes the next `k` jobs in order (fewer for the last batch)
    pub fn plan_next(&mut self, k: usize) -> Option<Vec<J>> {
        if self.backlog.is_empty() {
            return None;
        }
        let take = k.max(1).min(self.backlog.len());
        Some(self.backlog.drain(..take).collect())
    }

    pub fn remaining(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Drops the rest of the backlog, returning how many jobs were dropped
    pub fn abort(&mut self) -> usize {
        let dropped = self.backlog.len();
        self.backlog.clear();
        dropped
    }
}

/// Settled result of one job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Stored,
    Skipped(String),
    Failed(ClassifiedError),
}

/// Whether the backlog may continue after a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchVerdict {
    Continue,
    /// Target-wide failure; abort the remaining backlog
    Structural(String),
}

/// Judges a settled batch
///
/// A batch of two or more jobs is structural when every job was skipped, or
/// when every job failed as a parse error with the same message.
pub fn assess_batch(outcomes: &[JobOutcome]) -> BatchVerdict {
    if outcomes.len() < 2 {
        return BatchVerdict::Continue;
    }

    if outcomes.iter().all(|o| matches!(o, JobOutcome::Skipped(_))) {
        return BatchVerdict::Structural(format!(
            "all {} jobs in the batch were skipped",
            outcomes.len()
        ));
    }

    let mut messages = outcomes.iter().map(|o| match o {
        JobOutcome::Failed(e) if e.class == ErrorClass::ParseError => Some(e.source.message.as_str()),
        _ => None,
    });
    if let Some(Some(first)) = messages.next() {
        if messages.all(|m| m == Some(first)) {
            return BatchVerdict::Structural(format!("every job failed to parse: {}", first));
        }
    }

    BatchVerdict::Continue
}

/// Sleeps for `duration` unless cancelled first
///
/// Returns `false` when the pause was cut short by cancellation.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
