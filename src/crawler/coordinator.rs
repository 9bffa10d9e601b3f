//! Pipeline coordinator - the three fetch passes and the repair commands
//!
//! This module contains the orchestration that ties the crawler together:
//! - The target-list pass (list pages into `target_list.json`)
//! - The detail pass (detail pages for targets flagged `needsRefresh`)
//! - The item pass (each target's backlog through the batch scheduler)
//! - Re-fetching tracked failures and the verification pass
//! - The concurrency benchmark
//!
//! Every batch settles completely before the next one starts. Cancellation is
//! checked between batches only; in-flight requests are never aborted.

use crate::config::Config;
use crate::crawler::benchmark::{levels_for, recommend, run_level, BenchmarkReport};
use crate::crawler::retry::{with_retry, ClassifiedError, ErrorClass, RetryPolicy};
use crate::crawler::scheduler::{
    assess_batch, pause, BatchVerdict, ChunkScheduler, ConcurrencyController, JobOutcome,
    ThrottleDecision,
};
use crate::crawler::{Extraction, Extractor, FetchError, PageFetcher};
use crate::monitor::ResourceMonitor;
use crate::output::{Notifier, NotifyLevel, ProgressReporter, StatsCollector};
use crate::state::{
    slug_from_url, CrawlTarget, FetchJob, ItemProgress, ListingEntry, MergeOutcome, TargetDetail,
};
use crate::storage::{
    reconcile, verify_target, DataStore, FailureTracker, ProgressSender, ProgressWriter,
    StorageError, VerifyReport,
};
use crate::{ConfigError, Result, TomeError};
use chrono::Utc;
use futures_util::future::join_all;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Injected collaborators of a [`Pipeline`]
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub monitor: Arc<ResourceMonitor>,
    pub notifier: Arc<dyn Notifier>,
    pub stats: Arc<StatsCollector>,
    pub progress: Arc<ProgressReporter>,
}

/// Result of one target-list pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingSummary {
    pub pages_fetched: u32,
    pub entries_seen: usize,
    pub added: usize,
    pub changed: usize,
    pub total_targets: usize,
}

/// Result of one detail pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailSummary {
    pub pending: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of running one target's jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRunSummary {
    pub slug: String,
    pub scheduled: usize,
    pub stored: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Reason of a structural abort, if one happened
    pub aborted: Option<String>,
    pub progress: ItemProgress,
    pub pending_failures: Vec<u32>,
}

impl TargetRunSummary {
    pub fn is_complete(&self) -> bool {
        self.progress.is_complete(self.pending_failures.len())
    }
}

/// Result of one item pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemsSummary {
    pub targets: Vec<TargetRunSummary>,
    pub already_complete: usize,
    pub errors: usize,
}

impl ItemsSummary {
    pub fn stored(&self) -> usize {
        self.targets.iter().map(|t| t.stored).sum()
    }

    pub fn failed(&self) -> usize {
        self.targets.iter().map(|t| t.failed + t.skipped).sum()
    }
}

/// Result of re-fetching tracked failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub targets: Vec<TargetRunSummary>,
    pub total_failed: usize,
    pub succeeded: usize,
    pub remaining: usize,
}

/// One target's verification, before and after re-fetching its gaps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetVerification {
    pub initial: VerifyReport,
    pub refetch: Option<TargetRunSummary>,
    pub after: Option<VerifyReport>,
}

/// Result of the verification command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub targets: Vec<TargetVerification>,
    pub missing_detail: Vec<String>,
    pub errors: usize,
}

impl VerifySummary {
    pub fn cursor_corrections(&self) -> usize {
        self.targets.iter().filter(|t| t.initial.cursor_corrected()).count()
    }

    pub fn gaps(&self) -> usize {
        self.targets.iter().map(|t| t.initial.gaps.len()).sum()
    }

    pub fn missing_item_index(&self) -> usize {
        self.targets.iter().filter(|t| t.initial.item_index_missing).count()
    }
}

/// The fetch pipeline
pub struct Pipeline {
    config: Arc<Config>,
    store: DataStore,
    failures: FailureTracker,
    parts: Collaborators,
    retry: RetryPolicy,
    slug_pattern: Regex,
    base_url: Url,
    controller: Mutex<ConcurrencyController>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Creates a pipeline whose concurrency ceiling comes from the monitor
    pub fn new(
        config: Arc<Config>,
        store: DataStore,
        parts: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let slug_pattern = Regex::new(&config.source.slug_pattern)
            .map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        let base_url = Url::parse(&config.source.base_url)?;

        let suggested = parts.monitor.suggested_concurrency(
            config.crawler.memory_per_request_mb,
            config.crawler.max_concurrency,
        );
        let controller =
            ConcurrencyController::from_config(&config.crawler, &config.monitor, suggested);
        tracing::info!(
            "Concurrency: ceiling {} (suggested {}), floor {}",
            controller.ceiling(),
            suggested,
            controller.floor()
        );

        let retry = RetryPolicy::new(config.crawler.retry_count, config.crawler.retry_base_delay());

        Ok(Self {
            failures: FailureTracker::new(store.clone()),
            config,
            store,
            parts,
            retry,
            slug_pattern,
            base_url,
            controller: Mutex::new(controller),
            cancel,
        })
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parts(&self) -> &Collaborators {
        &self.parts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Concurrency level the next batch would use
    pub fn current_concurrency(&self) -> usize {
        self.controller
            .lock()
            .map(|c| c.current())
            .unwrap_or(1)
    }

    // ===== Target-list pass =====

    /// Walks the list pages and merges every entry into the target list
    pub async fn refresh_target_list(&self) -> Result<ListingSummary> {
        let mut list = self.store.load_target_list().await?;
        let first_pass = list.targets.is_empty();
        let source = &self.config.source;

        let mut summary = ListingSummary::default();
        let mut pages = ChunkScheduler::new(1..=source.max_list_pages);
        let mut empty_streak = 0u32;
        let bar = self.parts.progress.bar("listing", u64::from(source.max_list_pages));

        tracing::info!(
            "Refreshing target list ({} known{})",
            list.targets.len(),
            if first_pass { ", first pass" } else { "" }
        );

        while !pages.is_empty() {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping target-list pass");
                break;
            }

            let k = self.next_concurrency().await;
            let Some(batch) = pages.plan_next(k) else {
                break;
            };

            let results = join_all(batch.iter().map(|page| self.fetch_listing_page(*page))).await;

            for (page, result) in batch.iter().zip(results) {
                summary.pages_fetched += 1;
                let entries = match result {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!("List page {} failed: {}", page, e);
                        Vec::new()
                    }
                };

                if entries.is_empty() {
                    empty_streak += 1;
                    continue;
                }
                empty_streak = 0;

                for entry in entries {
                    summary.entries_seen += 1;
                    let Some(slug) = slug_from_url(&self.slug_pattern, &entry.url) else {
                        tracing::debug!("No slug in listing URL {}", entry.url);
                        continue;
                    };
                    let incomplete = self.is_incomplete(&slug, entry.total_items).await?;
                    match list.merge(slug, entry, incomplete, first_pass) {
                        MergeOutcome::Added => summary.added += 1,
                        MergeOutcome::Changed => summary.changed += 1,
                        MergeOutcome::Unchanged => {}
                    }
                }
            }
            bar.inc(batch.len() as u64);
            bar.set_message(format!("{} targets", list.total));

            list.last_updated = Some(Utc::now());
            self.store.save_target_list(&list).await?;

            if empty_streak >= source.empty_page_limit {
                tracing::info!("{} consecutive empty list pages, stopping", empty_streak);
                pages.abort();
                break;
            }

            if !pages.is_empty() {
                pause(self.config.crawler.batch_delay(), &self.cancel).await;
            }
        }

        bar.finish_and_clear();
        summary.total_targets = list.total;
        self.parts.stats.record_listed(summary.entries_seen);
        self.parts.stats.set_total_targets(list.total);

        tracing::info!(
            "Target list: {} pages, {} entries, {} added, {} changed, {} total",
            summary.pages_fetched,
            summary.entries_seen,
            summary.added,
            summary.changed,
            summary.total_targets
        );
        Ok(summary)
    }

    async fn fetch_listing_page(
        &self,
        page: u32,
    ) -> std::result::Result<Vec<ListingEntry>, ClassifiedError> {
        let url = self.config.source.list_url(page);
        let fetcher = &self.parts.fetcher;
        let extractor = &self.parts.extractor;
        let base = &self.base_url;
        let target = url.as_str();

        with_retry(&self.retry, target, move || async move {
            let doc = fetcher.fetch_page(target).await?;
            extractor.extract_listing(&doc, base)
        })
        .await
    }

    /// Whether a target still has outstanding items on disk
    async fn is_incomplete(&self, slug: &str, declared_total: u32) -> Result<bool> {
        let Some(detail) = self.store.load_detail(slug).await? else {
            return Ok(true);
        };
        if detail.scraped_count < declared_total {
            return Ok(true);
        }
        Ok(!self.failures.list_failures(slug).await?.is_empty())
    }

    // ===== Detail pass =====

    /// Fetches detail pages of every target flagged for refresh
    pub async fn fetch_details(&self) -> Result<DetailSummary> {
        let mut list = self.store.load_target_list().await?;
        let pending: Vec<CrawlTarget> = list
            .targets
            .iter()
            .filter(|t| t.needs_refresh)
            .cloned()
            .collect();

        let mut summary = DetailSummary {
            pending: pending.len(),
            ..DetailSummary::default()
        };
        tracing::info!("Fetching details for {} targets", pending.len());

        let batch_size = self.config.crawler.detail_concurrency;
        let bar = self.parts.progress.bar("details", pending.len() as u64);
        let mut chunks = ChunkScheduler::new(pending);

        while let Some(batch) = chunks.plan_next(batch_size) {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping detail pass");
                break;
            }

            let results = join_all(batch.iter().map(|t| self.refresh_detail(t))).await;

            for (target, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => {
                        summary.refreshed += 1;
                        if let Some(t) = list.find_mut(&target.slug) {
                            t.needs_refresh = false;
                        }
                    }
                    Ok(false) => summary.skipped += 1,
                    Err(e) => {
                        summary.failed += 1;
                        tracing::warn!("Detail for {} failed: {}", target.slug, e);
                    }
                }
            }

            list.last_updated = Some(Utc::now());
            self.store.save_target_list(&list).await?;
            bar.inc(batch.len() as u64);

            if !chunks.is_empty() {
                pause(self.config.crawler.batch_delay() * 2, &self.cancel).await;
            }
        }
        bar.finish_and_clear();

        tracing::info!(
            "Details: {} refreshed, {} skipped, {} failed of {}",
            summary.refreshed,
            summary.skipped,
            summary.failed,
            summary.pending
        );
        Ok(summary)
    }

    /// Fetches and persists one detail page; `Ok(false)` when skipped
    async fn refresh_detail(&self, target: &CrawlTarget) -> Result<bool> {
        let started = Instant::now();
        let fetcher = &self.parts.fetcher;
        let extractor = &self.parts.extractor;
        let url = target.url.as_str();

        let extraction = with_retry(&self.retry, url, move || async move {
            let doc = fetcher.fetch_page(url).await?;
            extractor.extract_detail(&doc)
        })
        .await
        .map_err(|source| TomeError::Fetch {
            url: target.url.clone(),
            source,
        })?;

        let record = match extraction {
            Extraction::Record(record) => record,
            Extraction::Skip(reason) => {
                tracing::info!("Skipping detail of {}: {}", target.slug, reason);
                return Ok(false);
            }
        };

        let scraped = match self.store.load_detail(&target.slug).await? {
            Some(existing) => existing.scraped_count,
            None => {
                let present = self.store.item_indices(&target.slug).await?;
                reconcile(&present, 0, record.total_count).contiguous
            }
        };

        let detail = TargetDetail {
            slug: target.slug.clone(),
            source_url: target.url.clone(),
            total_count: record.total_count,
            scraped_count: scraped.min(record.total_count),
            last_updated: Utc::now(),
            metadata: record.metadata,
        };
        self.store.save_detail(&detail).await?;
        self.store.save_item_index(&target.slug, &record.items).await?;
        self.parts.stats.record_detail(started.elapsed());

        tracing::debug!(
            "Detail of {}: {}/{} items",
            target.slug,
            detail.scraped_count,
            detail.total_count
        );
        Ok(true)
    }

    // ===== Item pass =====

    /// Runs the backlog of every target that is not complete
    pub async fn fetch_all_items(&self) -> Result<ItemsSummary> {
        let list = self.store.load_target_list().await?;
        let mut summary = ItemsSummary::default();
        let bar = self.parts.progress.bar("targets", list.targets.len() as u64);

        for target in &list.targets {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping item pass");
                break;
            }
            bar.inc(1);
            bar.set_message(target.slug.clone());

            let Some(detail) = self.store.load_detail(&target.slug).await? else {
                tracing::debug!("No detail for {}, skipping items", target.slug);
                continue;
            };
            let failures = self.failures.list_failures(&target.slug).await?;
            if detail.progress().is_complete(failures.len()) {
                summary.already_complete += 1;
                continue;
            }
            if detail.progress().cursor_at_end() {
                // Only tracked failures remain; those belong to the retry command
                continue;
            }

            match self.fetch_target_items(&target.slug).await {
                Ok(run) => {
                    if !run.pending_failures.is_empty() {
                        self.parts
                            .notifier
                            .notify(
                                &format!(
                                    "{} items failed for {}\nFailed items: {}",
                                    run.pending_failures.len(),
                                    run.slug,
                                    join_indices(&run.pending_failures)
                                ),
                                NotifyLevel::Warning,
                            )
                            .await;
                    }
                    summary.targets.push(run);
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!("Items of {} failed: {}", target.slug, e);
                }
            }
        }

        bar.finish_and_clear();
        tracing::info!(
            "Items: {} stored, {} failed across {} targets ({} already complete)",
            summary.stored(),
            summary.failed(),
            summary.targets.len(),
            summary.already_complete
        );
        Ok(summary)
    }

    /// Fetches a target's backlog from `scraped_count + 1`
    pub async fn fetch_target_items(&self, slug: &str) -> Result<TargetRunSummary> {
        let detail = self
            .store
            .load_detail(slug)
            .await?
            .ok_or_else(|| TomeError::TargetNotFound(slug.to_string()))?;

        let source = &self.config.source;
        let jobs = detail
            .progress()
            .backlog(slug, |index| source.item_url(&detail.source_url, index));

        tracing::info!(
            "Fetching {} items for {} ({}/{})",
            jobs.len(),
            slug,
            detail.scraped_count,
            detail.total_count
        );
        self.parts.stats.add_total_items(jobs.len() as u64);

        self.run_jobs(detail, jobs).await
    }

    /// Runs jobs of one target through the batch scheduler
    ///
    /// All progress and failure updates go through the target's writer.
    /// Failures of a batch are committed only after the batch was judged
    /// non-structural.
    async fn run_jobs(&self, detail: TargetDetail, jobs: Vec<FetchJob>) -> Result<TargetRunSummary> {
        let slug = detail.slug.clone();
        let writer = ProgressWriter::spawn(self.store.clone(), detail).await?;
        let sender = writer.sender();

        let mut run = TargetRunSummary {
            slug: slug.clone(),
            scheduled: jobs.len(),
            stored: 0,
            failed: 0,
            skipped: 0,
            aborted: None,
            progress: ItemProgress::new(0, 0),
            pending_failures: Vec::new(),
        };
        let bar = self.parts.progress.bar(&slug, jobs.len() as u64);
        let mut chunks = ChunkScheduler::new(jobs);

        while !chunks.is_empty() {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    "Cancellation requested, leaving {} jobs of {} for the next run",
                    chunks.remaining(),
                    slug
                );
                break;
            }

            let k = self.next_concurrency().await;
            let Some(batch) = chunks.plan_next(k) else {
                break;
            };

            let outcomes = join_all(batch.iter().map(|job| self.run_item_job(job, &sender))).await;

            if let BatchVerdict::Structural(reason) = assess_batch(&outcomes) {
                let dropped = chunks.abort();
                tracing::warn!(
                    "Structural failure on {}: {}; dropping {} remaining jobs",
                    slug,
                    reason,
                    dropped
                );
                run.aborted = Some(reason);
                break;
            }

            for (job, outcome) in batch.iter().zip(outcomes) {
                let context = format!("{} #{}", slug, job.index);
                match outcome {
                    JobOutcome::Stored => run.stored += 1,
                    JobOutcome::Skipped(reason) => {
                        run.skipped += 1;
                        let message = format!("not a usable record: {}", reason);
                        self.parts.stats.record_item_failure(message.clone(), context);
                        sender.failed(job.index, message).await?;
                    }
                    JobOutcome::Failed(e) => {
                        run.failed += 1;
                        self.parts.stats.record_item_failure(e.to_string(), context);
                        sender.failed(job.index, e.to_string()).await?;
                    }
                }
            }
            bar.inc(batch.len() as u64);

            if !chunks.is_empty() {
                pause(self.config.crawler.batch_delay(), &self.cancel).await;
            }
        }
        bar.finish_and_clear();

        drop(sender);
        let snapshot = writer.finish().await?;
        run.progress = snapshot.progress;
        run.pending_failures = snapshot.outstanding();

        tracing::info!(
            "{}: {} stored, {} failed, {} skipped, progress {}/{}{}",
            slug,
            run.stored,
            run.failed,
            run.skipped,
            run.progress.scraped_count,
            run.progress.total_count,
            if run.is_complete() { " (complete)" } else { "" }
        );
        Ok(run)
    }

    /// Fetches, extracts and persists one item
    async fn run_item_job(&self, job: &FetchJob, sender: &ProgressSender) -> JobOutcome {
        let started = Instant::now();
        let fetcher = &self.parts.fetcher;
        let extractor = &self.parts.extractor;
        let url = job.url.as_str();
        let context = format!("{} #{}", job.slug, job.index);

        let result = with_retry(&self.retry, &context, move || async move {
            let doc = fetcher.fetch_page(url).await?;
            extractor.extract_item(&doc)
        })
        .await;

        let record = match result {
            Ok(Extraction::Record(record)) => record,
            Ok(Extraction::Skip(reason)) => {
                tracing::debug!("Skipping {}: {}", context, reason);
                return JobOutcome::Skipped(reason);
            }
            Err(e) => return JobOutcome::Failed(e),
        };

        let persisted = match self.store.write_item(&job.slug, job.index, &record).await {
            Ok(()) => sender.stored(job.index).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            tracing::error!("Could not persist {}: {}", context, e);
            return JobOutcome::Failed(ClassifiedError {
                class: ErrorClass::Unknown,
                attempts: 1,
                source: FetchError::other(format!("persist failed: {}", e)),
            });
        }

        self.parts.stats.record_item_success(started.elapsed());
        JobOutcome::Stored
    }

    /// Re-reads metrics, applies the throttle rule and returns *k*
    async fn next_concurrency(&self) -> usize {
        let metrics = self.parts.monitor.current_metrics();
        let (decision, k) = {
            let mut controller = self.controller.lock().unwrap_or_else(|e| e.into_inner());
            let decision = controller.adjust(&metrics);
            (decision, controller.current())
        };

        match decision {
            ThrottleDecision::Shrink { from, to, cooldown } => {
                tracing::warn!(
                    "Host under load (cpu {:.1}%, memory {:.1}%), concurrency {} -> {}, cooling down {:?}",
                    metrics.cpu,
                    metrics.memory,
                    from,
                    to,
                    cooldown
                );
                pause(cooldown, &self.cancel).await;
            }
            ThrottleDecision::Grow { from, to } => {
                tracing::debug!("Concurrency {} -> {}", from, to);
            }
            ThrottleDecision::Hold => {}
        }
        k
    }

    // ===== Repair commands =====

    /// Re-fetches tracked failures of one target, or of every target on disk
    pub async fn retry_failed(&self, slug: Option<&str>) -> Result<RetrySummary> {
        let slugs = match slug {
            Some(s) => vec![s.to_string()],
            None => self.store.list_target_slugs().await?,
        };

        let mut summary = RetrySummary::default();
        for slug in &slugs {
            if self.cancel.is_cancelled() {
                break;
            }

            let failures = self.failures.list_failures(slug).await?;
            if failures.is_empty() {
                tracing::debug!("No failed items for {}", slug);
                continue;
            }

            let Some(detail) = self.store.load_detail(slug).await? else {
                if slugs.len() == 1 {
                    return Err(TomeError::TargetNotFound(slug.clone()));
                }
                tracing::warn!("{} has failed items but no detail record", slug);
                continue;
            };

            tracing::info!("Retrying {} failed items for {}", failures.len(), slug);
            let source = &self.config.source;
            let jobs: Vec<FetchJob> = failures
                .iter()
                .map(|f| FetchJob::new(slug, f.index, source.item_url(&detail.source_url, f.index)))
                .collect();

            match self.run_jobs(detail, jobs).await {
                Ok(run) => {
                    summary.total_failed += failures.len();
                    summary.succeeded += run.stored;
                    summary.remaining += run.pending_failures.len();
                    if run.pending_failures.is_empty() {
                        tracing::info!("All failed items of {} recovered", slug);
                    }
                    summary.targets.push(run);
                }
                Err(e) => tracing::error!("Retry of {} failed: {}", slug, e),
            }
        }

        Ok(summary)
    }

    /// Reconciles every listed target with its item files
    ///
    /// Unless `dry_run`, the gaps found are re-fetched and the target is
    /// reconciled again.
    pub async fn verify(&self, dry_run: bool) -> Result<VerifySummary> {
        let list = self.store.load_target_list().await?;
        let source = &self.config.source;
        let mut summary = VerifySummary::default();

        for target in &list.targets {
            if self.cancel.is_cancelled() {
                break;
            }

            let url_for = |base: &str, index: u32| source.item_url(base, index);
            let initial = match verify_target(&self.store, &target.slug, dry_run, url_for).await {
                Ok(report) => report,
                Err(StorageError::MissingDetail(slug)) => {
                    summary.missing_detail.push(slug);
                    continue;
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!("Verification of {} failed: {}", target.slug, e);
                    continue;
                }
            };

            let mut verification = TargetVerification {
                initial,
                refetch: None,
                after: None,
            };

            if !dry_run && !verification.initial.jobs.is_empty() {
                let jobs = verification.initial.jobs.clone();
                let refetched = match self.store.load_detail(&target.slug).await? {
                    Some(detail) => self.run_jobs(detail, jobs).await,
                    None => Err(TomeError::TargetNotFound(target.slug.clone())),
                };
                match refetched {
                    Ok(run) => {
                        verification.refetch = Some(run);
                        verification.after =
                            Some(verify_target(&self.store, &target.slug, false, url_for).await?);
                    }
                    Err(e) => {
                        summary.errors += 1;
                        tracing::error!("Re-fetching gaps of {} failed: {}", target.slug, e);
                    }
                }
            }

            summary.targets.push(verification);
        }

        tracing::info!(
            "Verification: {} targets, {} cursor corrections, {} gaps, {} without item index, {} without detail",
            summary.targets.len(),
            summary.cursor_corrections(),
            summary.gaps(),
            summary.missing_item_index(),
            summary.missing_detail.len()
        );
        Ok(summary)
    }

    // ===== Benchmark =====

    /// Fetches a sample of one target's items at increasing batch sizes
    ///
    /// Without `slug` the target with the most items is sampled. Nothing is
    /// written to the data directory.
    pub async fn benchmark(&self, slug: Option<&str>, sample_size: u32) -> Result<BenchmarkReport> {
        let detail = match slug {
            Some(slug) => self
                .store
                .load_detail(slug)
                .await?
                .ok_or_else(|| TomeError::TargetNotFound(slug.to_string()))?,
            None => self
                .largest_target()
                .await?
                .ok_or_else(|| TomeError::TargetNotFound("any listed target".to_string()))?,
        };

        let source = &self.config.source;
        let sample = sample_size.max(1).min(detail.total_count);
        let jobs: Vec<FetchJob> = (1..=sample)
            .map(|index| FetchJob::new(&detail.slug, index, source.item_url(&detail.source_url, index)))
            .collect();
        let levels = if jobs.is_empty() { Vec::new() } else { levels_for(jobs.len()) };

        tracing::info!(
            "Benchmarking {} with {} items at batch sizes {:?}",
            detail.slug,
            jobs.len(),
            levels
        );
        let bar = self.parts.progress.bar("benchmark", levels.len() as u64);
        let mut results = Vec::with_capacity(levels.len());

        for k in levels {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping benchmark");
                break;
            }
            let level = run_level(
                self.parts.fetcher.as_ref(),
                self.parts.extractor.as_ref(),
                &self.retry,
                &jobs,
                k,
                self.config.crawler.batch_delay(),
                &self.cancel,
            )
            .await;
            tracing::info!(
                "Batch size {}: {:.1}% ok, {:?} per request, {:?} total",
                k,
                level.success_rate(),
                level.avg_latency,
                level.elapsed
            );
            results.push(level);
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(BenchmarkReport {
            slug: detail.slug,
            sample_size: jobs.len(),
            recommended: recommend(&results),
            levels: results,
        })
    }

    /// Listed target with the largest declared item count
    async fn largest_target(&self) -> Result<Option<TargetDetail>> {
        let list = self.store.load_target_list().await?;
        let mut best: Option<TargetDetail> = None;
        for target in &list.targets {
            if let Some(detail) = self.store.load_detail(&target.slug).await? {
                if best.as_ref().map_or(true, |b| detail.total_count > b.total_count) {
                    best = Some(detail);
                }
            }
        }
        Ok(best)
    }
}

fn join_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
