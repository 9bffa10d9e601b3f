use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Tomecrawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

/// Remote source and URL grammar
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Origin used to absolutize relative links found on list pages
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// List page URL, `{page}` is replaced by the 1-based page number
    #[serde(rename = "list-url-template")]
    pub list_url_template: String,

    /// Item page URL, `{target}` is the target URL and `{index}` the item index
    #[serde(rename = "item-url-template", default = "default_item_url_template")]
    pub item_url_template: String,

    /// Regex whose first match in a target URL is the target slug
    #[serde(rename = "slug-pattern", default = "default_slug_pattern")]
    pub slug_pattern: String,

    /// Upper bound on list pages walked per pass
    #[serde(rename = "max-list-pages", default = "default_max_list_pages")]
    pub max_list_pages: u32,

    /// Consecutive empty list pages that end the pass
    #[serde(rename = "empty-page-limit", default = "default_empty_page_limit")]
    pub empty_page_limit: u32,

    /// Per-request timeout (seconds)
    #[serde(rename = "request-timeout", default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

impl SourceConfig {
    /// Builds the URL of list page `page`
    pub fn list_url(&self, page: u32) -> String {
        self.list_url_template.replace("{page}", &page.to_string())
    }

    /// Builds the URL of item `index` of the target at `target_url`
    pub fn item_url(&self, target_url: &str, index: u32) -> String {
        self.item_url_template
            .replace("{target}", target_url.trim_end_matches('/'))
            .replace("{index}", &index.to_string())
    }
}

/// Fetch pipeline tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Hard cap on in-flight requests
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Floor the adaptive throttle never shrinks below
    #[serde(rename = "min-concurrency")]
    pub min_concurrency: usize,

    /// Attempts per job, including the first
    #[serde(rename = "retry-count")]
    pub retry_count: u32,

    /// Base of every backoff curve (milliseconds)
    #[serde(rename = "retry-base-delay")]
    pub retry_base_delay: u64,

    /// Pause between batches (milliseconds)
    #[serde(rename = "batch-delay")]
    pub batch_delay: u64,

    /// Batch size of the detail pass
    #[serde(rename = "detail-concurrency")]
    pub detail_concurrency: usize,

    /// Pause between pipeline phases (milliseconds)
    #[serde(rename = "phase-cooldown")]
    pub phase_cooldown: u64,

    /// Memory budget assumed per in-flight request (MiB)
    #[serde(rename = "memory-per-request-mb")]
    pub memory_per_request_mb: u64,
}

impl CrawlerConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay)
    }

    pub fn phase_cooldown(&self) -> Duration {
        Duration::from_millis(self.phase_cooldown)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 15,
            min_concurrency: 2,
            retry_count: 3,
            retry_base_delay: 1000,
            batch_delay: 2000,
            detail_concurrency: 3,
            phase_cooldown: 5000,
            memory_per_request_mb: 100,
        }
    }
}

/// Resource monitor settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between samples
    #[serde(rename = "sample-interval")]
    pub sample_interval: u64,

    /// Seconds of samples retained
    pub window: u64,

    /// Percent above which concurrency shrinks
    #[serde(rename = "high-water")]
    pub high_water: f32,

    /// Percent below which concurrency grows
    #[serde(rename = "low-water")]
    pub low_water: f32,

    /// Resident size of this process, in MiB, above which phase checks warn
    #[serde(rename = "process-memory-warn-mb")]
    pub process_memory_warn_mb: u64,
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval)
    }

    /// Number of samples that fit in the retention window
    pub fn capacity(&self) -> usize {
        (self.window / self.sample_interval.max(1)).max(1) as usize
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: 30,
            window: 3600,
            high_water: 80.0,
            low_water: 50.0,
            process_memory_warn_mb: 500,
        }
    }
}

/// Cycle driver settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Seconds slept between cycles
    #[serde(rename = "cycle-period")]
    pub cycle_period: u64,

    /// Seconds after which a run lock is reclaimable regardless of its owner
    #[serde(rename = "lock-stale-after")]
    pub lock_stale_after: u64,

    /// Seconds granted to in-flight work after a termination signal
    #[serde(rename = "shutdown-grace")]
    pub shutdown_grace: u64,
}

impl DriverConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_period)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cycle_period: 6 * 60 * 60,
            lock_stale_after: 60 * 60,
            shutdown_grace: 10,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Root directory of every persisted record
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

/// Notification channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(rename = "telegram-token")]
    pub telegram_token: String,

    #[serde(rename = "telegram-chat-id")]
    pub telegram_chat_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_item_url_template() -> String {
    "{target}/chapter-{index}?default=true".to_string()
}

fn default_slug_pattern() -> String {
    r"serie-\d+".to_string()
}

fn default_max_list_pages() -> u32 {
    10_000
}

fn default_empty_page_limit() -> u32 {
    100
}

fn default_request_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("tomecrawl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}
