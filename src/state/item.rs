/// Per-target progress, item records and failure entries
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable resumption cursor of one target
///
/// Invariant: `scraped_count <= total_count`. The next backlog always starts
/// at `scraped_count + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub scraped_count: u32,
    pub total_count: u32,
}

impl ItemProgress {
    pub fn new(scraped_count: u32, total_count: u32) -> Self {
        Self {
            scraped_count: scraped_count.min(total_count),
            total_count,
        }
    }

    /// Number of indices not yet settled
    pub fn remaining(&self) -> u32 {
        self.total_count - self.scraped_count
    }

    /// Whether the cursor reached the upper bound
    pub fn cursor_at_end(&self) -> bool {
        self.scraped_count >= self.total_count
    }

    /// Whether the target is fully scraped
    ///
    /// The cursor alone is not enough: any tracked failure means some item
    /// below the cursor is still missing.
    pub fn is_complete(&self, pending_failures: usize) -> bool {
        self.cursor_at_end() && pending_failures == 0
    }

    /// Expands the gap between the cursor and the upper bound into jobs
    pub fn backlog<F>(&self, slug: &str, url_for: F) -> Vec<FetchJob>
    where
        F: Fn(u32) -> String,
    {
        (self.scraped_count + 1..=self.total_count)
            .map(|index| FetchJob::new(slug, index, url_for(index)))
            .collect()
    }
}

/// Metadata extracted from a target's detail page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub title: String,
    #[serde(default)]
    pub original_title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub genre: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub addition_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_url: String,
}

/// Contents of `targets/<slug>/detail.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDetail {
    pub slug: String,
    pub source_url: String,
    pub total_count: u32,
    pub scraped_count: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: TargetMetadata,
}

impl TargetDetail {
    pub fn progress(&self) -> ItemProgress {
        ItemProgress::new(self.scraped_count, self.total_count)
    }

    pub fn set_progress(&mut self, progress: ItemProgress) {
        self.scraped_count = progress.scraped_count;
        self.total_count = progress.total_count;
        self.last_updated = Utc::now();
    }
}

/// One entry of `targets/<slug>/item_index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemIndexEntry {
    pub index: u32,
    pub title: String,
}

/// What the detail page yields: metadata, declared count and item index
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRecord {
    pub total_count: u32,
    pub metadata: TargetMetadata,
    pub items: Vec<ItemIndexEntry>,
}

/// One fetched item's normalized content (`items/item_<n>.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub title: String,
    pub content: String,
}

/// Ephemeral unit of work, regenerated each run from [`ItemProgress`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchJob {
    pub slug: String,
    pub index: u32,
    pub url: String,
}

impl FetchJob {
    pub fn new(slug: &str, index: u32, url: String) -> Self {
        Self {
            slug: slug.to_string(),
            index,
            url,
        }
    }
}

/// An item that exhausted its retry budget (`failed_items.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub index: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl FailedItem {
    pub fn new(index: u32, error: impl Into<String>) -> Self {
        Self {
            index,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}
