//! Single writer for one target's cursor and failure list
//!
//! Fetch jobs of a target run concurrently but never touch `detail.json` or
//! `failed_items.json` themselves. They send events to one task that owns both
//! records, so updates are applied one at a time in arrival order.
//!
//! The cursor only advances over a contiguous run of settled indices. An index
//! is settled once its item file is written or its failure is recorded.
//!
//! Tracked failures are cleared together, once every one of them has been
//! stored again. Until then recovered indices stay listed.

use crate::state::{FailedItem, ItemProgress, TargetDetail};
use crate::storage::failures::upsert;
use crate::storage::{DataStore, FailureTracker, StorageError, StorageResult};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
enum ProgressEvent {
    Stored(u32),
    Failed(FailedItem),
}

/// Final state reported when the writer shuts down
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSnapshot {
    pub progress: ItemProgress,
    /// The failure list as persisted
    pub failures: Vec<FailedItem>,
    /// Listed indices that were stored during this run
    pub recovered: BTreeSet<u32>,
}

impl WriterSnapshot {
    /// Listed indices that have not been stored again
    pub fn outstanding(&self) -> Vec<u32> {
        self.failures
            .iter()
            .map(|f| f.index)
            .filter(|i| !self.recovered.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete(self.failures.len())
    }
}

/// State owned by the writer task
#[derive(Debug)]
pub struct ProgressWriter {
    store: DataStore,
    tracker: FailureTracker,
    detail: TargetDetail,
    failures: Vec<FailedItem>,
    recovered: BTreeSet<u32>,
    settled: BTreeSet<u32>,
    first_error: Option<StorageError>,
}

/// Which records an event dirtied
#[derive(Debug, Default, PartialEq, Eq)]
struct Dirty {
    detail: bool,
    failures: bool,
}

impl ProgressWriter {
    /// Loads the target's failure list and starts the writer task
    pub async fn spawn(store: DataStore, detail: TargetDetail) -> StorageResult<ProgressHandle> {
        let tracker = FailureTracker::new(store.clone());
        let failures = tracker.list_failures(&detail.slug).await?;
        let slug = detail.slug.clone();

        let writer = Self::new(store, tracker, detail, failures);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(writer.run(rx));

        Ok(ProgressHandle {
            sender: ProgressSender { slug, tx },
            task,
        })
    }

    fn new(
        store: DataStore,
        tracker: FailureTracker,
        detail: TargetDetail,
        failures: Vec<FailedItem>,
    ) -> Self {
        Self {
            store,
            tracker,
            detail,
            failures,
            recovered: BTreeSet::new(),
            settled: BTreeSet::new(),
            first_error: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ProgressEvent>) -> StorageResult<WriterSnapshot> {
        while let Some(event) = rx.recv().await {
            let dirty = self.apply(event);
            if dirty.failures {
                let result = self.tracker.save(&self.detail.slug, &self.failures).await;
                self.note(result);
            }
            if dirty.detail {
                let result = self.store.save_detail(&self.detail).await;
                self.note(result);
            }
        }

        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(WriterSnapshot {
                progress: self.detail.progress(),
                failures: self.failures,
                recovered: self.recovered,
            }),
        }
    }

    fn note(&mut self, result: StorageResult<()>) {
        if let Err(e) = result {
            tracing::error!(slug = %self.detail.slug, "Failed to persist progress: {}", e);
            self.first_error.get_or_insert(e);
        }
    }

    fn apply(&mut self, event: ProgressEvent) -> Dirty {
        let mut dirty = Dirty::default();
        let cursor = self.detail.scraped_count;

        let index = match event {
            ProgressEvent::Stored(index) => {
                if self.failures.iter().any(|f| f.index == index) {
                    self.recovered.insert(index);
                    if self.failures.iter().all(|f| self.recovered.contains(&f.index)) {
                        self.failures.clear();
                        self.recovered.clear();
                        dirty.failures = true;
                    }
                }
                index
            }
            ProgressEvent::Failed(item) => {
                let index = item.index;
                self.recovered.remove(&index);
                upsert(&mut self.failures, item);
                dirty.failures = true;
                index
            }
        };

        if index > cursor && index <= self.detail.total_count {
            self.settled.insert(index);
        }

        let mut progress = self.detail.progress();
        while progress.scraped_count < progress.total_count
            && self.settled.remove(&(progress.scraped_count + 1))
        {
            progress.scraped_count += 1;
        }
        if progress.scraped_count != cursor {
            self.detail.set_progress(progress);
            dirty.detail = true;
        }

        dirty
    }
}

/// Cloneable sending side handed to fetch jobs
#[derive(Debug, Clone)]
pub struct ProgressSender {
    slug: String,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Reports that item `index` was persisted
    pub async fn stored(&self, index: u32) -> StorageResult<()> {
        self.send(ProgressEvent::Stored(index)).await
    }

    /// Reports that item `index` exhausted its retries
    pub async fn failed(&self, index: u32, error: impl Into<String>) -> StorageResult<()> {
        self.send(ProgressEvent::Failed(FailedItem::new(index, error)))
            .await
    }

    async fn send(&self, event: ProgressEvent) -> StorageResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| StorageError::WriterClosed(self.slug.clone()))
    }
}

/// Owner's handle on a running writer
#[derive(Debug)]
pub struct ProgressHandle {
    sender: ProgressSender,
    task: JoinHandle<StorageResult<WriterSnapshot>>,
}

impl ProgressHandle {
    pub fn sender(&self) -> ProgressSender {
        self.sender.clone()
    }

    /// Closes the channel and waits until every queued event is persisted
    ///
    /// Outstanding [`ProgressSender`] clones must be dropped first.
    pub async fn finish(self) -> StorageResult<WriterSnapshot> {
        let Self { sender, task } = self;
        let slug = sender.slug.clone();
        drop(sender);
        task.await
            .map_err(|_| StorageError::WriterClosed(slug))?
    }
}
