//! Integration tests for the harvest pipeline
//!
//! These tests use wiremock to stand in for the catalog source and run the
//! passes, the repair commands and the cycle driver end-to-end against a
//! temporary data directory.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tomecrawl::config::parse_config;
use tomecrawl::crawler::{Collaborators, HttpFetcher, NextDataExtractor, Pipeline};
use tomecrawl::driver::{load_checkpoint, CycleDriver, LockAttempt, Locked, Phase, LivenessCheck, RunLock};
use tomecrawl::monitor::{MetricsSource, ResourceMonitor, ResourceSample};
use tomecrawl::output::{Notifier, NotifyLevel, ProgressReporter, StatsCollector};
use tomecrawl::state::{ItemRecord, TargetDetail};
use tomecrawl::storage::{DataStore, FailureTracker};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SLUG: &str = "serie-1";

struct QuietHost;

impl MetricsSource for QuietHost {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu: 5.0,
            memory: 30.0,
        }
    }

    fn cpu_count(&self) -> usize {
        2
    }

    fn available_memory(&self) -> u64 {
        4 * 1024 * 1024 * 1024
    }
}

/// Idle host whose own process holds `resident_mb`
struct BloatedHost {
    resident_mb: u64,
}

impl MetricsSource for BloatedHost {
    fn sample(&self) -> ResourceSample {
        QuietHost.sample()
    }

    fn cpu_count(&self) -> usize {
        2
    }

    fn available_memory(&self) -> u64 {
        4 * 1024 * 1024 * 1024
    }

    fn process_memory(&self) -> Option<u64> {
        Some(self.resident_mb * 1024 * 1024)
    }
}

struct FixedLiveness(bool);

impl LivenessCheck for FixedLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        self.0
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(NotifyLevel, String)>>,
}

impl RecordingNotifier {
    fn with_level(&self, level: NotifyLevel) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, level: NotifyLevel) {
        self.sent.lock().unwrap().push((level, message.to_string()));
    }
}

struct Harness {
    _dir: TempDir,
    store: DataStore,
    pipeline: Arc<Pipeline>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(server: &MockServer) -> Harness {
    harness_with(server, "")
}

fn harness_with(server: &MockServer, extra: &str) -> Harness {
    harness_on(server, extra, Arc::new(QuietHost))
}

/// Builds a harness on `host`, appending `extra` to the generated config
fn harness_on(server: &MockServer, extra: &str, host: Arc<dyn MetricsSource>) -> Harness {
    let dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
[source]
base-url = "{uri}"
list-url-template = "{uri}/list?page={{page}}"
item-url-template = "{{target}}/chapter-{{index}}"
max-list-pages = 2
empty-page-limit = 1

[crawler]
max-concurrency = 4
min-concurrency = 2
retry-count = 3
retry-base-delay = 1
batch-delay = 0
detail-concurrency = 2
phase-cooldown = 0

[output]
data-dir = "{data}"
{extra}
"#,
        uri = server.uri(),
        data = dir.path().display(),
        extra = extra
    );
    let config = Arc::new(parse_config(&toml).unwrap());
    let store = DataStore::new(dir.path());

    let notifier = Arc::new(RecordingNotifier::default());
    let stats = Arc::new(StatsCollector::new());
    let monitor = Arc::new(ResourceMonitor::new(
        host,
        config.monitor.clone(),
        notifier.clone(),
        stats.clone(),
    ));
    let parts = Collaborators {
        fetcher: Arc::new(HttpFetcher::new(&config.source).unwrap()),
        extractor: Arc::new(NextDataExtractor::new()),
        monitor,
        notifier: notifier.clone(),
        stats,
        progress: Arc::new(ProgressReporter::hidden()),
    };
    let pipeline = Pipeline::new(config, store.clone(), parts, CancellationToken::new()).unwrap();

    Harness {
        _dir: dir,
        store,
        pipeline: Arc::new(pipeline),
        notifier,
    }
}

fn next_data_page(json: &str, extra: &str) -> String {
    format!(
        r#"<html><body>{}<script id="__NEXT_DATA__" type="application/json">{}</script></body></html>"#,
        extra, json
    )
}

fn chapter_page(index: u32) -> String {
    next_data_page(
        &format!(
            r#"{{"props":{{"pageProps":{{"serie":{{"chapter_data":{{"data":{{"title":"Chapter {i}","body":["First line of {i}.","Second line."]}}}}}}}}}}}}"#,
            i = index
        ),
        "",
    )
}

fn detail_page(total: u32) -> String {
    let chapters: Vec<String> = (1..=total)
        .map(|i| format!(r#"{{"order":{},"title":"Chapter {}"}}"#, i, i))
        .collect();
    next_data_page(
        &format!(
            r#"{{"props":{{"pageProps":{{"serie":{{"chapters":[{}]}}}}}}}}"#,
            chapters.join(",")
        ),
        &format!(
            r#"<h1>The Long Road</h1><p class="lead">A story.</p>
               <div class="detail-item"><span>Ongoing</span><span>{} Chapters</span></div>"#,
            total
        ),
    )
}

async fn mount_chapter(server: &MockServer, index: u32, expected: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/chapter-{}", SLUG, index)))
        .respond_with(ResponseTemplate::new(200).set_body_string(chapter_page(index)))
        .expect(expected)
        .mount(server)
        .await;
}

async fn seed(h: &Harness, server: &MockServer, scraped: u32, total: u32, files: &[u32]) {
    h.store
        .save_detail(&TargetDetail {
            slug: SLUG.to_string(),
            source_url: format!("{}/{}", server.uri(), SLUG),
            total_count: total,
            scraped_count: scraped,
            last_updated: Utc::now(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
    for &index in files {
        h.store
            .write_item(
                SLUG,
                index,
                &ItemRecord {
                    title: format!("Chapter {}", index),
                    content: "seeded".to_string(),
                },
            )
            .await
            .unwrap();
    }
}

async fn files(h: &Harness) -> Vec<u32> {
    h.store.item_indices(SLUG).await.unwrap().into_iter().collect()
}

async fn scraped(h: &Harness) -> u32 {
    h.store.load_detail(SLUG).await.unwrap().unwrap().scraped_count
}

#[tokio::test]
async fn test_full_cycle_resumes_target() {
    let server = MockServer::start().await;
    let h = harness(&server);
    seed(&h, &server, 2, 5, &[1, 2]).await;

    let listing = format!(
        r#"<div class="serie-item">
             <a class="title" href="/{}">The Long Road</a>
             <div class="detail-item"><span>Ongoing</span><span>5 Chapters</span></div>
           </div>"#,
        SLUG
    );
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", SLUG)))
        .respond_with(ResponseTemplate::new(200).set_body_string(detail_page(5)))
        .expect(1)
        .mount(&server)
        .await;
    for index in 1..=2 {
        mount_chapter(&server, index, 0).await;
    }
    for index in 3..=5 {
        mount_chapter(&server, index, 1).await;
    }

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );
    let outcome = driver.run_cycle_once().await.unwrap();

    let Locked::Ran(report) = outcome else {
        panic!("cycle should not be contended");
    };
    assert!(report.errors.is_empty());
    assert_eq!(report.listing.as_ref().unwrap().added, 1);
    assert_eq!(report.details.as_ref().unwrap().refreshed, 1);
    assert_eq!(report.items.as_ref().unwrap().stored(), 3);

    assert_eq!(scraped(&h).await, 5);
    assert_eq!(files(&h).await, vec![1, 2, 3, 4, 5]);
    assert!(FailureTracker::new(h.store.clone())
        .list_failures(SLUG)
        .await
        .unwrap()
        .is_empty());
    assert!(!h.store.lock_path().exists());

    let list = h.store.load_target_list().await.unwrap();
    assert!(!list.find(SLUG).unwrap().needs_refresh);
    assert_eq!(h.store.load_item_index(SLUG).await.unwrap().unwrap().len(), 5);

    let checkpoint = load_checkpoint(&h.store).await.unwrap().unwrap();
    assert_eq!(checkpoint.phase, Phase::Idle);
    assert!(h.store.stats_path().exists());
    assert_eq!(h.notifier.with_level(NotifyLevel::Success).len(), 1);

    let item = h.store.read_item(SLUG, 4).await.unwrap().unwrap();
    assert_eq!(item.title, "Chapter 4");
    assert!(item.content.contains("First line of 4."));
}

#[tokio::test]
async fn test_persistent_server_error_is_tracked_then_recovered() {
    let server = MockServer::start().await;
    let h = harness(&server);
    seed(&h, &server, 2, 5, &[1, 2]).await;

    mount_chapter(&server, 3, 1).await;
    mount_chapter(&server, 5, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/chapter-4", SLUG)))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let run = h.pipeline.fetch_target_items(SLUG).await.unwrap();

    assert_eq!(run.stored, 2);
    assert_eq!(run.failed, 1);
    assert_eq!(run.pending_failures, vec![4]);
    assert!(!run.is_complete());
    assert_eq!(scraped(&h).await, 5);
    assert_eq!(files(&h).await, vec![1, 2, 3, 5]);

    let failures = FailureTracker::new(h.store.clone()).list_failures(SLUG).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("500"));

    server.verify().await;
    server.reset().await;
    mount_chapter(&server, 4, 1).await;

    let retried = h.pipeline.retry_failed(Some(SLUG)).await.unwrap();

    assert_eq!(retried.total_failed, 1);
    assert_eq!(retried.succeeded, 1);
    assert_eq!(retried.remaining, 0);
    assert!(!h.store.failed_items_path(SLUG).exists());
    assert_eq!(files(&h).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(scraped(&h).await, 5);
}

#[tokio::test]
async fn test_item_pass_warns_about_failed_indices() {
    let server = MockServer::start().await;
    let h = harness(&server);
    seed(&h, &server, 0, 3, &[]).await;

    let mut list = h.store.load_target_list().await.unwrap();
    list.merge(
        SLUG.to_string(),
        tomecrawl::state::ListingEntry {
            url: format!("{}/{}", server.uri(), SLUG),
            total_items: 3,
            status: "ongoing".to_string(),
        },
        true,
        true,
    );
    h.store.save_target_list(&list).await.unwrap();

    mount_chapter(&server, 1, 1).await;
    mount_chapter(&server, 3, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/chapter-2", SLUG)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let summary = h.pipeline.fetch_all_items().await.unwrap();

    assert_eq!(summary.stored(), 2);
    assert_eq!(summary.failed(), 1);
    let warnings = h.notifier.with_level(NotifyLevel::Warning);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Failed items: 2"));

    // Already settled targets are left alone on the next pass
    let again = h.pipeline.fetch_all_items().await.unwrap();
    assert!(again.targets.is_empty());
}

#[tokio::test]
async fn test_verify_corrects_cursor_and_refetches_gap() {
    let server = MockServer::start().await;
    let h = harness(&server);
    seed(&h, &server, 5, 5, &[1, 2, 3, 5]).await;

    let mut list = h.store.load_target_list().await.unwrap();
    list.merge(
        SLUG.to_string(),
        tomecrawl::state::ListingEntry {
            url: format!("{}/{}", server.uri(), SLUG),
            total_items: 5,
            status: "ongoing".to_string(),
        },
        false,
        false,
    );
    h.store.save_target_list(&list).await.unwrap();

    // Dry run: report only, no requests and no writes
    let dry = h.pipeline.verify(true).await.unwrap();
    assert_eq!(dry.targets.len(), 1);
    assert_eq!(dry.targets[0].initial.corrected_scraped, 3);
    assert_eq!(dry.targets[0].initial.gaps, vec![4]);
    assert!(dry.targets[0].refetch.is_none());
    assert_eq!(scraped(&h).await, 5);
    assert!(server.received_requests().await.unwrap().is_empty());

    mount_chapter(&server, 4, 1).await;
    let summary = h.pipeline.verify(false).await.unwrap();

    let target = &summary.targets[0];
    assert_eq!(target.initial.previous_scraped, 5);
    assert_eq!(target.initial.corrected_scraped, 3);
    assert_eq!(target.refetch.as_ref().unwrap().stored, 1);
    let after = target.after.as_ref().unwrap();
    assert_eq!(after.corrected_scraped, 5);
    assert!(after.gaps.is_empty());

    assert_eq!(scraped(&h).await, 5);
    assert_eq!(files(&h).await, vec![1, 2, 3, 4, 5]);
    assert!(!h.store.failed_items_path(SLUG).exists());
}

#[tokio::test]
async fn test_verify_raises_cursor_to_file_count() {
    let server = MockServer::start().await;
    let h = harness(&server);
    seed(&h, &server, 5, 10, &[1, 2, 3, 4, 5, 6, 7]).await;

    let mut list = h.store.load_target_list().await.unwrap();
    list.merge(
        SLUG.to_string(),
        tomecrawl::state::ListingEntry {
            url: format!("{}/{}", server.uri(), SLUG),
            total_items: 10,
            status: "ongoing".to_string(),
        },
        false,
        false,
    );
    h.store.save_target_list(&list).await.unwrap();

    let summary = h.pipeline.verify(false).await.unwrap();

    let report = &summary.targets[0].initial;
    assert_eq!(report.corrected_scraped, 7);
    assert!(report.gaps.is_empty());
    assert!(summary.targets[0].refetch.is_none());
    assert_eq!(scraped(&h).await, 7);
}

#[tokio::test]
async fn test_cycle_skipped_while_live_instance_holds_lock() {
    let server = MockServer::start().await;
    let h = harness(&server);
    h.store.ensure_root().await.unwrap();

    let marker = format!(
        r#"{{"pid":4242,"hostname":"{}","acquiredAt":"{}"}}"#,
        sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        Utc::now().to_rfc3339()
    );
    std::fs::write(h.store.lock_path(), &marker).unwrap();

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );
    let outcome = driver.run_cycle_once().await.unwrap();

    assert!(matches!(outcome, Locked::Contended { pid: 4242, .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(h.store.lock_path()).unwrap(), marker);
    assert!(load_checkpoint(&h.store).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dead_owner_lock_is_reclaimed_for_retry() {
    let server = MockServer::start().await;
    let h = harness(&server);
    h.store.ensure_root().await.unwrap();

    let marker = format!(
        r#"{{"pid":4242,"hostname":"{}","acquiredAt":"{}"}}"#,
        sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        Utc::now().to_rfc3339()
    );
    std::fs::write(h.store.lock_path(), &marker).unwrap();

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(false)),
        CancellationToken::new(),
    );
    let outcome = driver
        .run_locked("retry-failed", |pipeline| async move {
            pipeline.retry_failed(None).await
        })
        .await
        .unwrap();

    let Locked::Ran(summary) = outcome else {
        panic!("dead owner should not block the command");
    };
    assert_eq!(summary.total_failed, 0);
    assert!(!h.store.lock_path().exists());
}

#[tokio::test]
async fn test_long_run_keeps_lock_past_stale_window() {
    let server = MockServer::start().await;
    let h = harness_with(&server, "[driver]\nlock-stale-after = 1\n");

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );
    let rival = RunLock::new(h.store.lock_path(), Duration::from_secs(1), Arc::new(FixedLiveness(true)));

    let long_run = driver.run_locked("long", |_| async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        Ok(())
    });
    let late_attempt = async {
        tokio::time::sleep(Duration::from_millis(1600)).await;
        rival.try_acquire().await.unwrap()
    };
    let (outcome, attempt) = tokio::join!(long_run, late_attempt);

    assert!(matches!(outcome.unwrap(), Locked::Ran(())));
    assert!(matches!(attempt, LockAttempt::Contended { .. }));
    assert!(!h.store.lock_path().exists());
}

#[tokio::test]
async fn test_cycle_warns_about_process_memory_per_phase() {
    let server = MockServer::start().await;
    let h = harness_on(
        &server,
        "[monitor]\nprocess-memory-warn-mb = 500",
        Arc::new(BloatedHost { resident_mb: 640 }),
    );
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );
    let outcome = driver.run_cycle_once().await.unwrap();
    assert!(matches!(outcome, Locked::Ran(_)));

    let warnings = h.notifier.with_level(NotifyLevel::Warning);
    for context in ["cycle_start", "listing_done", "details_done", "items_done", "cycle_end"] {
        assert!(
            warnings.iter().any(|w| w.contains(&format!("High memory usage at {}", context))),
            "no warning for {}: {:?}",
            context,
            warnings
        );
    }
}

#[tokio::test]
async fn test_repair_commands_sample_host_while_locked() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );

    let outcome = driver
        .run_locked("retry-failed", |pipeline| async move {
            let sampling = pipeline.parts().monitor.is_running();
            pipeline.retry_failed(None).await.map(|summary| (sampling, summary))
        })
        .await
        .unwrap();
    let Locked::Ran((sampling, summary)) = outcome else {
        panic!("lock should be free");
    };
    assert!(sampling);
    assert_eq!(summary.total_failed, 0);
    assert!(!h.pipeline.parts().monitor.is_running());

    let outcome = driver
        .run_locked("verify", |pipeline| async move {
            let sampling = pipeline.parts().monitor.is_running();
            pipeline.verify(true).await.map(|_| sampling)
        })
        .await
        .unwrap();
    assert!(matches!(outcome, Locked::Ran(true)));
    assert!(!h.pipeline.parts().monitor.is_running());
}

#[tokio::test]
async fn test_cycle_leaves_running_monitor_to_its_owner() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let monitor = Arc::clone(&h.pipeline.parts().monitor);
    monitor.start();

    let driver = CycleDriver::new(
        Arc::clone(&h.pipeline),
        Arc::new(FixedLiveness(true)),
        CancellationToken::new(),
    );
    let outcome = driver
        .run_locked("verify", |pipeline| async move { pipeline.verify(true).await })
        .await
        .unwrap();

    assert!(matches!(outcome, Locked::Ran(_)));
    assert!(monitor.is_running());
    monitor.stop().await;
}
