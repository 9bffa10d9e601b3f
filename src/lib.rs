//! Tomecrawl: a resumable catalog harvester
//!
//! This crate pulls a paginated catalog of works (each with metadata and an
//! ordered sequence of chapters) from a single remote source and writes
//! normalized JSON records per target, adapting its parallelism to host load
//! and resuming from durable per-target cursors after restarts.

pub mod config;
pub mod crawler;
pub mod driver;
pub mod monitor;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Tomecrawl operations
#[derive(Debug, Error)]
pub enum TomeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch failed for {url}: {source}")]
    Fetch {
        url: String,
        source: crawler::ClassifiedError,
    },

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Run lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid slug pattern: {0}")]
    InvalidPattern(String),
}

/// Result type alias for Tomecrawl operations
pub type Result<T> = std::result::Result<T, TomeError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{ErrorClass, FetchError, Pipeline};
pub use driver::{CycleDriver, RunLock};
pub use state::{CrawlTarget, FailedItem, FetchJob, ItemProgress};
