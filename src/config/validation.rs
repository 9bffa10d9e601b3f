use crate::config::types::{
    Config, CrawlerConfig, DriverConfig, MonitorConfig, NotifyConfig, OutputConfig, SourceConfig,
};
use crate::ConfigError;
use regex::Regex;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_source_config(&config.source)?;
    validate_crawler_config(&config.crawler)?;
    validate_monitor_config(&config.monitor)?;
    validate_driver_config(&config.driver)?;
    validate_output_config(&config.output)?;
    if let Some(notify) = &config.notify {
        validate_notify_config(notify)?;
    }
    Ok(())
}

/// Validates the source URL grammar
fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    let base = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;
    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url must be http(s), got '{}'",
            config.base_url
        )));
    }

    if !config.list_url_template.contains("{page}") {
        return Err(ConfigError::Validation(format!(
            "list_url_template must contain '{{page}}', got '{}'",
            config.list_url_template
        )));
    }
    Url::parse(&config.list_url(1))
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid list_url_template: {}", e)))?;

    for placeholder in ["{target}", "{index}"] {
        if !config.item_url_template.contains(placeholder) {
            return Err(ConfigError::Validation(format!(
                "item_url_template must contain '{}', got '{}'",
                placeholder, config.item_url_template
            )));
        }
    }

    let pattern = Regex::new(&config.slug_pattern)
        .map_err(|e| ConfigError::InvalidPattern(format!("'{}': {}", config.slug_pattern, e)))?;
    if pattern.is_match("") {
        return Err(ConfigError::InvalidPattern(format!(
            "slug_pattern '{}' matches the empty string",
            config.slug_pattern
        )));
    }

    if config.max_list_pages < 1 {
        return Err(ConfigError::Validation(
            "max_list_pages must be >= 1".to_string(),
        ));
    }

    if config.empty_page_limit < 1 {
        return Err(ConfigError::Validation(
            "empty_page_limit must be >= 1".to_string(),
        ));
    }

    if config.request_timeout < 1 {
        return Err(ConfigError::Validation(
            "request_timeout must be >= 1s".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_concurrency < 1 || config.max_concurrency > 100 {
        return Err(ConfigError::Validation(format!(
            "max_concurrency must be between 1 and 100, got {}",
            config.max_concurrency
        )));
    }

    if config.min_concurrency < 1 {
        return Err(ConfigError::Validation(format!(
            "min_concurrency must be >= 1, got {}",
            config.min_concurrency
        )));
    }

    if config.min_concurrency > config.max_concurrency {
        return Err(ConfigError::Validation(format!(
            "min_concurrency ({}) cannot exceed max_concurrency ({})",
            config.min_concurrency, config.max_concurrency
        )));
    }

    if config.retry_count < 1 {
        return Err(ConfigError::Validation(
            "retry_count must be >= 1".to_string(),
        ));
    }

    if config.detail_concurrency < 1 {
        return Err(ConfigError::Validation(
            "detail_concurrency must be >= 1".to_string(),
        ));
    }

    if config.memory_per_request_mb < 1 {
        return Err(ConfigError::Validation(
            "memory_per_request_mb must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates the throttle watermarks
fn validate_monitor_config(config: &MonitorConfig) -> Result<(), ConfigError> {
    if config.sample_interval < 1 {
        return Err(ConfigError::Validation(
            "sample_interval must be >= 1s".to_string(),
        ));
    }

    if config.window < config.sample_interval {
        return Err(ConfigError::Validation(format!(
            "window ({}s) must cover at least one sample_interval ({}s)",
            config.window, config.sample_interval
        )));
    }

    for (name, value) in [("high_water", config.high_water), ("low_water", config.low_water)] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(ConfigError::Validation(format!(
                "{} must be in (0, 100], got {}",
                name, value
            )));
        }
    }

    if config.low_water >= config.high_water {
        return Err(ConfigError::Validation(format!(
            "low_water ({}) must be below high_water ({})",
            config.low_water, config.high_water
        )));
    }

    Ok(())
}

fn validate_driver_config(config: &DriverConfig) -> Result<(), ConfigError> {
    if config.lock_stale_after < 1 {
        return Err(ConfigError::Validation(
            "lock_stale_after must be >= 1s".to_string(),
        ));
    }
    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.data_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "data_dir cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_notify_config(config: &NotifyConfig) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }
    if config.telegram_token.is_empty() || config.telegram_chat_id.is_empty() {
        return Err(ConfigError::Validation(
            "telegram_token and telegram_chat_id are required when notifications are enabled"
                .to_string(),
        ));
    }
    Ok(())
}
