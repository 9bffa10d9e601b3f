//! Session statistics and the persisted stats ring
//!
//! One [`StatsCollector`] lives for a whole process session. Its snapshot is
//! saved into `stats.json`, which keeps the most recent sessions first.

use crate::storage::{read_json, write_json, DataStore, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Sessions kept in `stats.json`
pub const SESSION_RING_SIZE: usize = 10;

/// Errors kept per session
pub const RECENT_ERRORS: usize = 20;

/// Host resource peaks and averages over a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub max_cpu: f32,
    pub max_memory: f32,
    pub average_cpu: f32,
    pub average_memory: f32,
    pub samples: u64,
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsError {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub context: String,
}

/// Summary of one process session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_targets: usize,
    pub listed_targets: usize,
    pub scraped_details: u64,
    pub total_items: u64,
    pub successful_items: u64,
    pub failed_items: u64,
    pub average_time_per_item_ms: f64,
    pub average_time_per_detail_ms: f64,
    pub resource_usage: ResourceUsage,
    pub errors: Vec<StatsError>,
}

impl SessionStats {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            total_targets: 0,
            listed_targets: 0,
            scraped_details: 0,
            total_items: 0,
            successful_items: 0,
            failed_items: 0,
            average_time_per_item_ms: 0.0,
            average_time_per_detail_ms: 0.0,
            resource_usage: ResourceUsage::default(),
            errors: Vec::new(),
        }
    }

    /// Share of attempted items that succeeded, in percent
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.successful_items + self.failed_items;
        (attempted > 0).then(|| self.successful_items as f64 / attempted as f64 * 100.0)
    }
}

fn running_average(average: f64, count: u64, value: f64) -> f64 {
    if count == 0 {
        return value;
    }
    (average * (count - 1) as f64 + value) / count as f64
}

/// Thread-safe accumulator for the current session
#[derive(Debug)]
pub struct StatsCollector {
    session: Mutex<SessionStats>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(SessionStats::new(Utc::now())),
        }
    }

    fn update<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut session);
    }

    pub fn set_total_targets(&self, total: usize) {
        self.update(|s| s.total_targets = total);
    }

    pub fn record_listed(&self, count: usize) {
        self.update(|s| s.listed_targets += count);
    }

    pub fn record_detail(&self, elapsed: Duration) {
        self.update(|s| {
            s.scraped_details += 1;
            s.average_time_per_detail_ms = running_average(
                s.average_time_per_detail_ms,
                s.scraped_details,
                elapsed.as_secs_f64() * 1000.0,
            );
        });
    }

    pub fn add_total_items(&self, count: u64) {
        self.update(|s| s.total_items += count);
    }

    pub fn record_item_success(&self, elapsed: Duration) {
        self.update(|s| {
            s.successful_items += 1;
            s.average_time_per_item_ms = running_average(
                s.average_time_per_item_ms,
                s.successful_items,
                elapsed.as_secs_f64() * 1000.0,
            );
        });
    }

    pub fn record_item_failure(&self, error: impl Into<String>, context: impl Into<String>) {
        let entry = StatsError {
            timestamp: Utc::now(),
            error: error.into(),
            context: context.into(),
        };
        self.update(|s| {
            s.failed_items += 1;
            s.errors.push(entry);
            if s.errors.len() > RECENT_ERRORS {
                let excess = s.errors.len() - RECENT_ERRORS;
                s.errors.drain(..excess);
            }
        });
    }

    pub fn record_resources(&self, cpu: f32, memory: f32) {
        self.update(|s| {
            let usage = &mut s.resource_usage;
            usage.max_cpu = usage.max_cpu.max(cpu);
            usage.max_memory = usage.max_memory.max(memory);
            usage.samples += 1;
            let n = usage.samples as f32;
            usage.average_cpu += (cpu - usage.average_cpu) / n;
            usage.average_memory += (memory - usage.average_memory) / n;
        });
    }

    pub fn snapshot(&self) -> SessionStats {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stamps the end time and writes this session into the ring
    pub async fn save(&self, store: &DataStore) -> StorageResult<()> {
        self.update(|s| s.end_time = Some(Utc::now()));
        let current = self.snapshot();

        let mut sessions = load_sessions(store).await?;
        sessions.retain(|s| s.start_time != current.start_time);
        sessions.insert(0, current);
        sessions.truncate(SESSION_RING_SIZE);

        write_json(&store.stats_path(), &sessions).await
    }
}

/// Reads the stats ring, most recent session first
pub async fn load_sessions(store: &DataStore) -> StorageResult<Vec<SessionStats>> {
    Ok(read_json(&store.stats_path()).await?.unwrap_or_default())
}

/// Renders a session as a human-readable report
pub fn format_report(stats: &SessionStats) -> String {
    let end = stats.end_time.unwrap_or_else(Utc::now);
    let hours = (end - stats.start_time).num_seconds() as f64 / 3600.0;

    let mut report = String::new();
    report.push_str("=== Session Report ===\n\n");
    report.push_str(&format!("Duration: {:.2} hours\n\n", hours));

    report.push_str("Targets:\n");
    report.push_str(&format!("  Known targets: {}\n", stats.total_targets));
    report.push_str(&format!("  Listed this session: {}\n", stats.listed_targets));
    report.push_str(&format!("  Details fetched: {}\n", stats.scraped_details));
    report.push_str(&format!(
        "  Avg time/detail: {:.2}ms\n\n",
        stats.average_time_per_detail_ms
    ));

    report.push_str("Items:\n");
    report.push_str(&format!("  Scheduled: {}\n", stats.total_items));
    report.push_str(&format!("  Succeeded: {}\n", stats.successful_items));
    report.push_str(&format!("  Failed: {}\n", stats.failed_items));
    if let Some(rate) = stats.success_rate() {
        report.push_str(&format!("  Success rate: {:.2}%\n", rate));
    }
    report.push_str(&format!(
        "  Avg time/item: {:.2}ms\n\n",
        stats.average_time_per_item_ms
    ));

    let usage = &stats.resource_usage;
    report.push_str("Resources:\n");
    report.push_str(&format!(
        "  CPU: peak {:.1}%, average {:.1}%\n",
        usage.max_cpu, usage.average_cpu
    ));
    report.push_str(&format!(
        "  Memory: peak {:.1}%, average {:.1}%\n",
        usage.max_memory, usage.average_memory
    ));

    if !stats.errors.is_empty() {
        report.push_str("\nLast errors:\n");
        for e in stats.errors.iter().rev().take(5) {
            report.push_str(&format!("  - {} ({})\n", e.error, e.context));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_running_averages() {
        let stats = StatsCollector::new();
        stats.record_item_success(Duration::from_millis(100));
        stats.record_item_success(Duration::from_millis(300));
        stats.record_resources(20.0, 40.0);
        stats.record_resources(60.0, 50.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.successful_items, 2);
        assert!((snapshot.average_time_per_item_ms - 200.0).abs() < 0.01);
        assert_eq!(snapshot.resource_usage.max_cpu, 60.0);
        assert!((snapshot.resource_usage.average_cpu - 40.0).abs() < 0.01);
        assert!((snapshot.resource_usage.average_memory - 45.0).abs() < 0.01);
    }

    #[test]
    fn test_error_list_is_bounded() {
        let stats = StatsCollector::new();
        for i in 0..25 {
            stats.record_item_failure(format!("error {}", i), "serie-1");
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed_items, 25);
        assert_eq!(snapshot.errors.len(), RECENT_ERRORS);
        assert_eq!(snapshot.errors[0].error, "error 5");
        assert_eq!(snapshot.success_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn test_save_replaces_own_entry_and_bounds_ring() {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());

        for _ in 0..12 {
            StatsCollector::new().save(&store).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let current = StatsCollector::new();
        current.save(&store).await.unwrap();
        current.record_item_success(Duration::from_millis(5));
        current.save(&store).await.unwrap();

        let sessions = load_sessions(&store).await.unwrap();
        assert_eq!(sessions.len(), SESSION_RING_SIZE);
        assert_eq!(sessions[0].successful_items, 1);
        assert_eq!(
            sessions.iter().filter(|s| s.start_time == sessions[0].start_time).count(),
            1
        );
    }

    #[test]
    fn test_format_report() {
        let stats = StatsCollector::new();
        stats.record_item_failure("HTTP 500", "serie-1 #4");
        let report = format_report(&stats.snapshot());

        assert!(report.contains("Failed: 1"));
        assert!(report.contains("HTTP 500 (serie-1 #4)"));
    }
}
