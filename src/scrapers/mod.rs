//! Extraction and crawling for timeline and feed sources.

pub mod dates;
pub mod feed;
pub mod feed_crawler;
pub mod http_client;
pub mod login;
pub mod page;
pub mod payloads;
pub mod rate_limiter;
pub mod timeline;

use thiserror::Error;

pub use feed_crawler::{FeedCrawler, FeedCrawlerConfig};
pub use http_client::{BodyStream, FetchError, Fetcher, HttpClient};
pub use login::{HumanInput, LoginCredentials, LoginError, LoginFlow};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use timeline::{AccountCrawler, TimelineConfig};

use crate::browser::BrowserError;
use crate::services::ingest::IngestError;
use crate::storage::StorageError;

/// Errors that end a single account or domain crawl.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Login failed: {0}")]
    Login(#[from] LoginError),
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Ingestion stopped: {0}")]
    Pipeline(#[from] IngestError),
}

impl CrawlError {
    /// Whether the failure should stop the whole run rather than one source.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Storage(_) | CrawlError::Pipeline(_))
    }
}

/// Totals for one crawled account or domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub posts: usize,
    pub assets: usize,
    pub batches: usize,
}

impl CrawlSummary {
    pub(crate) fn record(&mut self, posts: usize, assets: usize) {
        self.posts += posts;
        self.assets += assets;
        self.batches += 1;
    }
}
