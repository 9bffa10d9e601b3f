//! Offline reconciliation of cursors against persisted item files
//!
//! Nothing here touches the network. The pass trusts the files on disk over
//! the recorded cursor: the cursor becomes the contiguous prefix of item
//! files, and every hole above that prefix is tracked as a failure so the
//! caller can re-fetch exactly those indices. Holes are searched up to the
//! highest file or the recorded cursor, whichever is further.

use crate::state::{FailedItem, FetchJob};
use crate::storage::failures::upsert;
use crate::storage::{DataStore, FailureTracker, StorageError, StorageResult};
use std::collections::BTreeSet;

/// Pure result of comparing a cursor with the files present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Length of the contiguous run `1..=n` of files, capped at the total
    pub contiguous: u32,

    /// Indices missing up to the highest present file or the recorded cursor
    pub gaps: Vec<u32>,
}

/// Compares the set of item files with a target's cursor and declared total
pub fn reconcile(present: &BTreeSet<u32>, scraped_count: u32, total_count: u32) -> Reconciliation {
    let mut contiguous = 0;
    while contiguous < total_count && present.contains(&(contiguous + 1)) {
        contiguous += 1;
    }

    let highest = present
        .range(..=total_count)
        .next_back()
        .copied()
        .unwrap_or(0);
    let end = highest.max(scraped_count.min(total_count));
    let gaps = (contiguous + 1..=end)
        .filter(|i| !present.contains(i))
        .collect();

    Reconciliation { contiguous, gaps }
}

/// What the pass found and changed for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub slug: String,
    pub total_count: u32,
    pub files_present: usize,
    pub previous_scraped: u32,
    pub corrected_scraped: u32,
    pub gaps: Vec<u32>,
    pub item_index_missing: bool,

    /// Jobs for the gap indices, ready for the scheduler
    pub jobs: Vec<FetchJob>,
}

impl VerifyReport {
    pub fn cursor_corrected(&self) -> bool {
        self.previous_scraped != self.corrected_scraped
    }

    pub fn has_issues(&self) -> bool {
        self.cursor_corrected() || !self.gaps.is_empty() || self.item_index_missing
    }
}

/// Reconciles one target and persists the corrections
///
/// `url_for` builds an item URL from the target's source URL and an index.
/// With `dry_run` the report is computed but nothing is written.
pub async fn verify_target<F>(
    store: &DataStore,
    slug: &str,
    dry_run: bool,
    url_for: F,
) -> StorageResult<VerifyReport>
where
    F: Fn(&str, u32) -> String,
{
    let mut detail = store
        .load_detail(slug)
        .await?
        .ok_or_else(|| StorageError::MissingDetail(slug.to_string()))?;

    let present = store.item_indices(slug).await?;
    let item_index_missing = store
        .load_item_index(slug)
        .await?
        .map(|entries| entries.is_empty())
        .unwrap_or(true);

    let Reconciliation { contiguous, gaps } = reconcile(&present, detail.scraped_count, detail.total_count);
    let previous_scraped = detail.scraped_count;

    if previous_scraped != contiguous {
        tracing::info!(
            slug,
            from = previous_scraped,
            to = contiguous,
            files = present.len(),
            "Correcting cursor to match item files"
        );
        if !dry_run {
            let mut progress = detail.progress();
            progress.scraped_count = contiguous;
            detail.set_progress(progress);
            store.save_detail(&detail).await?;
        }
    }

    if !gaps.is_empty() {
        tracing::warn!(slug, ?gaps, "Missing item files");
        if !dry_run {
            let tracker = FailureTracker::new(store.clone());
            let mut failures = tracker.list_failures(slug).await?;
            let mut changed = false;
            for index in &gaps {
                if !failures.iter().any(|f| f.index == *index) {
                    upsert(&mut failures, FailedItem::new(*index, "item file missing"));
                    changed = true;
                }
            }
            if changed {
                tracker.save(slug, &failures).await?;
            }
        }
    }

    let jobs = gaps
        .iter()
        .map(|index| FetchJob::new(slug, *index, url_for(&detail.source_url, *index)))
        .collect();

    Ok(VerifyReport {
        slug: slug.to_string(),
        total_count: detail.total_count,
        files_present: present.len(),
        previous_scraped,
        corrected_scraped: contiguous,
        gaps,
        item_index_missing,
        jobs,
    })
}
