//! HTTP fetcher implementation
//!
//! This module handles the network side of the pipeline:
//! - Building the HTTP client with the configured user agent and timeout
//! - Turning transport failures and non-2xx responses into structured
//!   [`FetchError`] values the retry policy can classify

use crate::config::SourceConfig;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;
use thiserror::Error;

const MAX_REDIRECTS: usize = 5;

/// Structured failure of one fetch or extraction
///
/// Classification reads the flags and the status, never the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
    /// HTTP status, when a response was received
    pub status: Option<u16>,

    /// No response at all (DNS, refused, reset, timeout)
    pub connectivity: bool,

    /// The payload arrived but its structured content could not be decoded
    pub malformed: bool,

    pub message: String,
}

impl FetchError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            status: None,
            connectivity: true,
            malformed: false,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            connectivity: false,
            malformed: false,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            status: None,
            connectivity: false,
            malformed: true,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            connectivity: false,
            malformed: false,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::status(status.as_u16(), e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return Self::connectivity(e.to_string());
        }
        if e.is_decode() {
            return Self::malformed(e.to_string());
        }
        Self::other(e.to_string())
    }
}

/// A successfully received page
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Network boundary of the pipeline
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<RawDocument, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use tomecrawl::config::load_config;
/// use tomecrawl::crawler::build_http_client;
/// use std::path::Path;
///
/// let config = load_config(Path::new("tomecrawl.toml")).unwrap();
/// let client = build_http_client(&config.source).unwrap();
/// ```
pub fn build_http_client(config: &SourceConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout))
        .connect_timeout(Duration::from_secs(config.request_timeout.min(10)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// [`PageFetcher`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &SourceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<RawDocument, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            return Err(FetchError::status(
                status.as_u16(),
                format!("HTTP {} for {}", status.as_u16(), final_url),
            ));
        }

        let body = response.text().await?;
        tracing::trace!("Fetched {} ({} bytes)", final_url, body.len());

        Ok(RawDocument {
            url: final_url,
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(base: &str) -> SourceConfig {
        SourceConfig {
            base_url: base.to_string(),
            list_url_template: format!("{}/list?page={{page}}", base),
            item_url_template: "{target}/chapter-{index}".to_string(),
            slug_pattern: r"serie-\d+".to_string(),
            max_list_pages: 10,
            empty_page_limit: 2,
            request_timeout: 5,
            user_agent: "TestHarvester/1.0".to_string(),
        }
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(&source("https://x.test")).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&source(&server.uri())).unwrap();
        let doc = fetcher
            .fetch_page(&format!("{}/page", server.uri()))
            .await
            .unwrap();

        assert_eq!(doc.status, 200);
        assert_eq!(doc.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_fetch_non_success_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&source(&server.uri())).unwrap();
        let error = fetcher
            .fetch_page(&format!("{}/busy", server.uri()))
            .await
            .unwrap_err();

        assert_eq!(error.status, Some(429));
        assert!(!error.connectivity);
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_connectivity() {
        let fetcher = HttpFetcher::new(&source("http://127.0.0.1:9")).unwrap();
        let error = fetcher.fetch_page("http://127.0.0.1:9/").await.unwrap_err();
        assert!(error.connectivity);
    }
}
