//! State module for the harvest data model
//!
//! # Components
//!
//! - `CrawlTarget` / `TargetList`: catalog entries merged on every list pass
//! - `ItemProgress` / `TargetDetail`: the durable per-target resumption cursor
//! - `FetchJob`: ephemeral units of work expanded from the cursor
//! - `FailedItem`: items that exhausted their retry budget

mod item;
mod target;

// Re-export main types
pub use item::{
    DetailRecord, FailedItem, FetchJob, ItemIndexEntry, ItemProgress, ItemRecord, TargetDetail,
    TargetMetadata,
};
pub use target::{slug_from_url, CrawlTarget, ListingEntry, MergeOutcome, TargetList};
