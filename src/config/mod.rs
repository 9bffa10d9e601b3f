//! Configuration module for Tomecrawl
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use tomecrawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("tomecrawl.toml")).unwrap();
//! println!("Data lands in: {}", config.output.data_dir.display());
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, DriverConfig, MonitorConfig, NotifyConfig, OutputConfig, SourceConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
