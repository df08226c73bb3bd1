//! HTTP fetching for feeds, landing pages and assets.
//!
//! Crawlers depend on the [`Fetcher`] trait so they can be driven by an
//! in-process fake; [`HttpClient`] is the reqwest-backed implementation with
//! adaptive per-domain rate limiting.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use thiserror::Error;
use tracing::debug;

use super::rate_limiter::RateLimiter;

const USER_AGENT: &str = "dank/0.4 (content archive)";

/// Real browser user agents for impersonate mode.
const IMPERSONATE_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
];

/// Resolve user agent from config value.
/// - None => default user agent
/// - "impersonate" => random real browser user agent
/// - other => custom user agent string
pub fn resolve_user_agent(config: Option<&str>) -> String {
    match config {
        None => USER_AGENT.to_string(),
        Some("impersonate") => IMPERSONATE_USER_AGENTS
            .choose(&mut rand::thread_rng())
            .unwrap_or(&USER_AGENT)
            .to_string(),
        Some(custom) => custom.to_string(),
    }
}

/// Errors from a single fetch. Always isolated to the item being fetched.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A response body read incrementally.
#[async_trait]
pub trait BodyStream: Send {
    /// Declared `Content-Length`, if any.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError>;
}

/// Source of remote documents.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` as text, sending `accept` as the Accept header when non-empty.
    async fn fetch_text(&self, url: &str, accept: &[String]) -> Result<String, FetchError>;

    /// GET `url` and hand back the body as a stream.
    async fn open(&self, url: &str) -> Result<Box<dyn BodyStream>, FetchError>;
}

/// HTTP client with adaptive per-domain rate limiting.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    request_delay: Duration,
    rate_limiter: RateLimiter,
}

impl HttpClient {
    /// Create a new HTTP client with its own rate limiter.
    pub fn new(
        user_agent: Option<&str>,
        timeout: Duration,
        request_delay: Duration,
    ) -> Result<Self, FetchError> {
        Self::with_rate_limiter(user_agent, timeout, request_delay, RateLimiter::new())
    }

    /// Create a new HTTP client with a shared rate limiter.
    pub fn with_rate_limiter(
        user_agent: Option<&str>,
        timeout: Duration,
        request_delay: Duration,
        rate_limiter: RateLimiter,
    ) -> Result<Self, FetchError> {
        let user_agent = resolve_user_agent(user_agent);
        let client = Client::builder()
            .user_agent(&user_agent)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            request_delay,
            rate_limiter,
        })
    }

    /// Make a GET request. Non-success statuses become [`FetchError::Status`].
    async fn get(&self, url: &str, accept: &[String]) -> Result<Response, FetchError> {
        // Wait for rate limiter before making request
        let domain = self.rate_limiter.acquire(url).await;

        let mut request = self.client.get(url);
        if !accept.is_empty() {
            request = request.header(ACCEPT, accept.join(", "));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        debug!("GET {} -> {}", url, status);

        if let Some(ref domain) = domain {
            self.rate_limiter.report_status(domain, status).await;
        }

        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch_text(&self, url: &str, accept: &[String]) -> Result<String, FetchError> {
        Ok(self.get(url, accept).await?.text().await?)
    }

    async fn open(&self, url: &str) -> Result<Box<dyn BodyStream>, FetchError> {
        let response = self.get(url, &[]).await?;
        Ok(Box::new(ResponseBody { response }))
    }
}

struct ResponseBody {
    response: Response,
}

#[async_trait]
impl BodyStream for ResponseBody {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        Ok(self.response.chunk().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(None, Duration::from_secs(5), Duration::ZERO).unwrap()
    }

    #[test]
    fn test_resolve_user_agent() {
        assert_eq!(resolve_user_agent(None), USER_AGENT);
        assert_eq!(resolve_user_agent(Some("custom/1.0")), "custom/1.0");
        assert!(IMPERSONATE_USER_AGENTS.contains(&resolve_user_agent(Some("impersonate")).as_str()));
    }

    #[tokio::test]
    async fn test_fetch_text_sends_accept_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("accept", "application/rss+xml, application/xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
            .mount(&server)
            .await;

        let accept = vec![
            "application/rss+xml".to_string(),
            "application/xml".to_string(),
        ];
        let body = client()
            .fetch_text(&format!("{}/feed", server.uri()), &accept)
            .await
            .unwrap();
        assert_eq!(body, "<rss/>");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client()
            .fetch_text(&format!("{}/missing", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_open_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let mut body = client()
            .open(&format!("{}/a.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(body.content_length(), Some(64));

        let mut total = 0;
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 64);
    }
}
