use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use tomecrawl::config::load_config;
///
/// let config = load_config(Path::new("tomecrawl.toml")).unwrap();
/// println!("Concurrency cap: {}", config.crawler.max_concurrency);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Logged at start-up so runs can be correlated with the settings they used.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const MINIMAL: &str = r#"
[source]
base-url = "https://catalog.example.com"
list-url-template = "https://catalog.example.com/en/novel-list?orderBy=reader&page={page}"

[output]
data-dir = "./data"
"#;

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let file = create_temp_config(MINIMAL);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.crawler.max_concurrency, 15);
        assert_eq!(config.crawler.min_concurrency, 2);
        assert_eq!(config.crawler.retry_count, 3);
        assert_eq!(config.monitor.high_water, 80.0);
        assert_eq!(config.driver.cycle_period, 21_600);
        assert_eq!(config.source.slug_pattern, r"serie-\d+");
        assert!(config.notify.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let config_content = r#"
[source]
base-url = "https://catalog.example.com"
list-url-template = "https://catalog.example.com/list?page={page}"
item-url-template = "{target}/ch/{index}"
slug-pattern = "book-\\d+"
max-list-pages = 50
empty-page-limit = 5
request-timeout = 20
user-agent = "TestHarvester/1.0"

[crawler]
max-concurrency = 8
min-concurrency = 2
retry-count = 4
retry-base-delay = 500
batch-delay = 100
detail-concurrency = 2
phase-cooldown = 0
memory-per-request-mb = 64

[monitor]
sample-interval = 10
window = 600
high-water = 85.0
low-water = 40.0

[driver]
cycle-period = 3600
lock-stale-after = 1800
shutdown-grace = 5

[output]
data-dir = "/var/lib/tomecrawl"

[notify]
telegram-token = "token"
telegram-chat-id = "42"
"#;

        let file = create_temp_config(config_content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.crawler.max_concurrency, 8);
        assert_eq!(config.crawler.retry_count, 4);
        assert_eq!(config.monitor.capacity(), 60);
        assert_eq!(config.source.item_url("https://x.test/book-1/", 7), "https://x.test/book-1/ch/7");
        assert_eq!(config.source.list_url(3), "https://catalog.example.com/list?page=3");
        assert!(config.notify.unwrap().enabled);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config_content = format!("{}\n[crawler]\nbatch-delay = 250\n", MINIMAL);
        let config = parse_config(&config_content).unwrap();

        assert_eq!(config.crawler.batch_delay, 250);
        assert_eq!(config.crawler.max_concurrency, 15);
        assert_eq!(config.crawler.phase_cooldown, 5000);
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/tomecrawl.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let config_content = format!("{}\n[crawler]\nmax-concurrency = 0\n", MINIMAL);
        let file = create_temp_config(&config_content);
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_compute_config_hash() {
        let file = create_temp_config("test content");

        let hash1 = compute_config_hash(file.path()).unwrap();
        let hash2 = compute_config_hash(file.path()).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_different_content_different_hash() {
        let file1 = create_temp_config("content 1");
        let file2 = create_temp_config("content 2");

        let hash1 = compute_config_hash(file1.path()).unwrap();
        let hash2 = compute_config_hash(file2.path()).unwrap();

        assert_ne!(hash1, hash2);
    }
}
