/// Catalog entries and the persisted target list
///
/// Targets are created or merged on each list pass and never deleted.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One catalog entry as seen on a list page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlTarget {
    /// Stable identifier derived from the URL
    pub slug: String,

    /// Source URL of the target's detail page (identity key)
    pub url: String,

    /// Item count currently declared by the source
    pub total_items: u32,

    /// Item count declared before the most recent merge
    #[serde(default)]
    pub last_known_items: Option<u32>,

    /// Publication status as shown on the list page
    pub status: String,

    /// Whether the detail pass must revisit this target
    pub needs_refresh: bool,
}

/// A row extracted from a list page, before merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub url: String,
    pub total_items: u32,
    pub status: String,
}

/// Contents of `target_list.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetList {
    pub total: usize,
    pub targets: Vec<CrawlTarget>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// What a single merge did to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    Changed,
    Unchanged,
}

impl TargetList {
    pub fn find(&self, slug: &str) -> Option<&CrawlTarget> {
        self.targets.iter().find(|t| t.slug == slug)
    }

    pub fn find_mut(&mut self, slug: &str) -> Option<&mut CrawlTarget> {
        self.targets.iter_mut().find(|t| t.slug == slug)
    }

    /// Merges a freshly listed entry by URL identity
    ///
    /// `incomplete` reports whether the target still has outstanding items on
    /// disk; `first_pass` forces every target to be refreshed.
    pub fn merge(
        &mut self,
        slug: String,
        entry: ListingEntry,
        incomplete: bool,
        first_pass: bool,
    ) -> MergeOutcome {
        let outcome = match self.targets.iter_mut().find(|t| t.url == entry.url) {
            None => {
                self.targets.push(CrawlTarget {
                    slug,
                    url: entry.url,
                    total_items: entry.total_items,
                    last_known_items: None,
                    status: entry.status,
                    needs_refresh: true,
                });
                MergeOutcome::Added
            }
            Some(existing) => {
                let count_changed = existing.total_items != entry.total_items;
                existing.last_known_items = Some(existing.total_items);
                existing.total_items = entry.total_items;
                existing.status = entry.status;
                // A pending refresh from an interrupted pass is never dropped
                existing.needs_refresh =
                    first_pass || count_changed || incomplete || existing.needs_refresh;
                if count_changed {
                    MergeOutcome::Changed
                } else {
                    MergeOutcome::Unchanged
                }
            }
        };
        self.total = self.targets.len();
        outcome
    }
}

/// Extracts a target slug from its URL with the configured pattern
pub fn slug_from_url(pattern: &Regex, url: &str) -> Option<String> {
    pattern.find(url).map(|m| m.as_str().to_string())
}
