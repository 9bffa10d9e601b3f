//! On-disk layout and JSON persistence
//!
//! Every record is written to a sibling temp file and renamed into place, so a
//! crash never leaves a half-written JSON document behind.

use crate::state::{ItemIndexEntry, ItemRecord, TargetDetail, TargetList};
use crate::storage::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const TARGET_LIST_FILE: &str = "target_list.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const LOCK_FILE: &str = "run.lock";
const STATS_FILE: &str = "stats.json";
const TARGETS_DIR: &str = "targets";
const DETAIL_FILE: &str = "detail.json";
const ITEM_INDEX_FILE: &str = "item_index.json";
const FAILED_ITEMS_FILE: &str = "failed_items.json";
const ITEMS_DIR: &str = "items";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Handle on the data directory
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_list_path(&self) -> PathBuf {
        self.root.join(TARGET_LIST_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    pub fn target_dir(&self, slug: &str) -> PathBuf {
        self.root.join(TARGETS_DIR).join(slug)
    }

    pub fn detail_path(&self, slug: &str) -> PathBuf {
        self.target_dir(slug).join(DETAIL_FILE)
    }

    pub fn item_index_path(&self, slug: &str) -> PathBuf {
        self.target_dir(slug).join(ITEM_INDEX_FILE)
    }

    pub fn failed_items_path(&self, slug: &str) -> PathBuf {
        self.target_dir(slug).join(FAILED_ITEMS_FILE)
    }

    pub fn items_dir(&self, slug: &str) -> PathBuf {
        self.target_dir(slug).join(ITEMS_DIR)
    }

    pub fn item_path(&self, slug: &str, index: u32) -> PathBuf {
        self.items_dir(slug).join(format!("item_{}.json", index))
    }

    /// Creates the data directory if needed
    pub async fn ensure_root(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    // ===== Target list =====

    /// Loads the target list, or an empty one if none was written yet
    pub async fn load_target_list(&self) -> StorageResult<TargetList> {
        Ok(read_json(&self.target_list_path()).await?.unwrap_or_default())
    }

    pub async fn save_target_list(&self, list: &TargetList) -> StorageResult<()> {
        write_json(&self.target_list_path(), list).await
    }

    // ===== Per-target records =====

    pub async fn load_detail(&self, slug: &str) -> StorageResult<Option<TargetDetail>> {
        read_json(&self.detail_path(slug)).await
    }

    pub async fn save_detail(&self, detail: &TargetDetail) -> StorageResult<()> {
        write_json(&self.detail_path(&detail.slug), detail).await
    }

    pub async fn load_item_index(&self, slug: &str) -> StorageResult<Option<Vec<ItemIndexEntry>>> {
        read_json(&self.item_index_path(slug)).await
    }

    pub async fn save_item_index(&self, slug: &str, entries: &[ItemIndexEntry]) -> StorageResult<()> {
        write_json(&self.item_index_path(slug), &entries).await
    }

    pub async fn write_item(&self, slug: &str, index: u32, record: &ItemRecord) -> StorageResult<()> {
        write_json(&self.item_path(slug, index), record).await
    }

    pub async fn read_item(&self, slug: &str, index: u32) -> StorageResult<Option<ItemRecord>> {
        read_json(&self.item_path(slug, index)).await
    }

    /// Indices of every persisted item file of a target
    pub async fn item_indices(&self, slug: &str) -> StorageResult<BTreeSet<u32>> {
        let dir = self.items_dir(slug);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };

        let mut indices = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            if let Some(index) = entry.file_name().to_str().and_then(parse_item_file_name) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    /// Slugs of every target directory on disk
    pub async fn list_target_slugs(&self) -> StorageResult<Vec<String>> {
        let dir = self.root.join(TARGETS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };

        let mut slugs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                slugs.push(name.to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

/// Parses `item_<n>.json` into `n`
pub fn parse_item_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("item_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
        .filter(|n| *n > 0)
}

/// Reads and decodes a JSON file, `None` if it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::serialization(path, e))
}

/// Encodes a value as pretty JSON and atomically replaces `path`
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StorageError::serialization(path, e))?;

    let parent = path
        .parent()
        .ok_or_else(|| StorageError::io(path, std::io::Error::other("no parent directory")))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io(parent, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp_path = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| StorageError::io(&tmp_path, e))?;

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StorageError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_parse_item_file_name() {
        assert_eq!(parse_item_file_name("item_1.json"), Some(1));
        assert_eq!(parse_item_file_name("item_120.json"), Some(120));
        assert_eq!(parse_item_file_name("item_0.json"), None);
        assert_eq!(parse_item_file_name("item_x.json"), None);
        assert_eq!(parse_item_file_name(".item_3.json.1.0.tmp"), None);
        assert_eq!(parse_item_file_name("detail.json"), None);
    }

    #[tokio::test]
    async fn test_missing_files_read_as_none() {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());

        assert!(store.load_detail("serie-1").await.unwrap().is_none());
        assert!(store.item_indices("serie-1").await.unwrap().is_empty());
        assert_eq!(store.load_target_list().await.unwrap().total, 0);
        assert!(store.list_target_slugs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_roundtrip_and_indices() {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());
        let record = ItemRecord {
            title: "Chapter".to_string(),
            content: "<p>text</p>".to_string(),
        };

        for index in [1, 2, 5] {
            store.write_item("serie-1", index, &record).await.unwrap();
        }

        let indices: Vec<u32> = store.item_indices("serie-1").await.unwrap().into_iter().collect();
        assert_eq!(indices, vec![1, 2, 5]);
        assert_eq!(store.read_item("serie-1", 5).await.unwrap(), Some(record));
        assert_eq!(store.list_target_slugs().await.unwrap(), vec!["serie-1".to_string()]);
    }

    #[tokio::test]
    async fn test_write_json_replaces_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());
        let mut detail = crate::state::TargetDetail {
            slug: "serie-1".to_string(),
            source_url: "https://x.test/serie-1".to_string(),
            total_count: 3,
            scraped_count: 0,
            last_updated: Utc::now(),
            metadata: Default::default(),
        };

        store.save_detail(&detail).await.unwrap();
        detail.scraped_count = 2;
        store.save_detail(&detail).await.unwrap();

        let loaded = store.load_detail("serie-1").await.unwrap().unwrap();
        assert_eq!(loaded.scraped_count, 2);

        let leftovers = std::fs::read_dir(store.target_dir("serie-1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_corrupt_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());
        std::fs::create_dir_all(store.target_dir("serie-1")).unwrap();
        std::fs::write(store.detail_path("serie-1"), b"{not json").unwrap();

        let result = store.load_detail("serie-1").await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }
}
