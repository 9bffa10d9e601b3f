//! Per-target lists of items that exhausted their retries
//!
//! The list is keyed by item index: recording an index twice keeps the most
//! recent error. An emptied list removes its file.

use crate::state::FailedItem;
use crate::storage::{read_json, write_json, DataStore, StorageError, StorageResult};

/// Reads and writes `failed_items.json` for any target
#[derive(Debug, Clone)]
pub struct FailureTracker {
    store: DataStore,
}

impl FailureTracker {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    /// Current failures of a target, ordered by index
    pub async fn list_failures(&self, slug: &str) -> StorageResult<Vec<FailedItem>> {
        let mut items: Vec<FailedItem> = read_json(&self.store.failed_items_path(slug))
            .await?
            .unwrap_or_default();
        items.sort_by_key(|f| f.index);
        Ok(items)
    }

    /// Records one failure, replacing any earlier entry for the same index
    pub async fn record_failure(
        &self,
        slug: &str,
        index: u32,
        error: impl Into<String>,
    ) -> StorageResult<()> {
        let mut items = self.list_failures(slug).await?;
        upsert(&mut items, FailedItem::new(index, error));
        self.save(slug, &items).await
    }

    pub async fn clear(&self, slug: &str) -> StorageResult<()> {
        self.save(slug, &[]).await
    }

    /// Writes the whole list; an empty list deletes the file
    pub async fn save(&self, slug: &str, items: &[FailedItem]) -> StorageResult<()> {
        let path = self.store.failed_items_path(slug);
        if items.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::io(&path, e)),
            };
        }
        write_json(&path, items).await
    }
}

/// Inserts or replaces the entry for `item.index`, keeping index order
pub(crate) fn upsert(items: &mut Vec<FailedItem>, item: FailedItem) {
    match items.binary_search_by_key(&item.index, |f| f.index) {
        Ok(pos) => items[pos] = item,
        Err(pos) => items.insert(pos, item),
    }
}
