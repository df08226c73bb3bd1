//! RSS/Atom crawler for feed sources.
//!
//! For each domain the crawler reuses feed links discovered within the
//! staleness window, or rediscovers them from the site's landing page. Each
//! feed is fetched and parsed; entries are processed in chunks, their
//! landing pages fetched with bounded concurrency, and every chunk becomes
//! one batch of posts plus the media found on those pages.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::feed::{
    discover_feed_links, feed_accept, parse_feed_entries, sort_feed_links, FeedEntry,
};
use super::http_client::Fetcher;
use super::page::{extract_page_assets, extract_page_published_at};
use super::{CrawlError, CrawlSummary};
use crate::models::{AssetDiscovery, Batch, FeedLink, RawPost};
use crate::services::ingest::BatchSender;
use crate::storage::FeedLinkCache;

pub const RSS_SOURCE: &str = "rss";

const HTML_ACCEPT: [&str; 3] = ["text/html", "application/xhtml+xml", "application/xml"];

/// Feed crawl tuning.
#[derive(Debug, Clone)]
pub struct FeedCrawlerConfig {
    /// Entries per emitted batch.
    pub batch_size: usize,
    /// Landing pages fetched at once.
    pub page_concurrency: usize,
    /// How long discovered feed links stay valid.
    pub feed_staleness: chrono::Duration,
}

impl Default for FeedCrawlerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            page_concurrency: 4,
            feed_staleness: chrono::Duration::days(14),
        }
    }
}

/// Stable identity of a feed entry: hex SHA-256 of its URL.
pub fn post_id_for_url(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Post payload bundling the feed entry with its landing page.
pub fn compose_payload(feed_xml: &str, page_html: &str) -> String {
    json!({"feed_xml": feed_xml, "page_html": page_html}).to_string()
}

fn html_accept() -> Vec<String> {
    HTML_ACCEPT.iter().map(|s| s.to_string()).collect()
}

/// Crawls feed sources through a [`Fetcher`].
#[derive(Clone)]
pub struct FeedCrawler {
    fetcher: Arc<dyn Fetcher>,
    config: FeedCrawlerConfig,
}

impl FeedCrawler {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: FeedCrawlerConfig) -> Self {
        Self { fetcher, config }
    }

    /// Crawl a domain, refreshing its cached feed links when they are stale.
    pub async fn crawl_domain(
        &self,
        domain: &str,
        cache: &FeedLinkCache,
        sink: &BatchSender,
    ) -> Result<CrawlSummary, CrawlError> {
        let root_url = format!("https://{}", domain);
        let now = Utc::now();

        let recent = cache
            .load_recent(domain, now - self.config.feed_staleness)
            .await?;
        if recent.is_empty() {
            let discovered = self.discover(&root_url).await;
            if discovered.is_empty() {
                warn!("No RSS feeds found for {}", root_url);
            } else {
                info!("Discovered {} feeds for {}", discovered.len(), domain);
                cache.save(domain, &discovered, now).await?;
            }
        } else {
            debug!("Reusing {} cached feeds for {}", recent.len(), domain);
        }

        let mut links = cache.load_all(domain).await?;
        sort_feed_links(&mut links);
        self.crawl_feeds(domain, &root_url, &links, sink).await
    }

    /// Feed links advertised by the landing page. Fetch failures yield none.
    pub async fn discover(&self, root_url: &str) -> Vec<FeedLink> {
        match self.fetcher.fetch_text(root_url, &html_accept()).await {
            Ok(html) => discover_feed_links(&html, root_url),
            Err(e) => {
                warn!("Failed to fetch {}: {}", root_url, e);
                Vec::new()
            }
        }
    }

    /// Crawl the given feeds in order, skipping entries already seen in an
    /// earlier feed of the same domain.
    pub async fn crawl_feeds(
        &self,
        domain: &str,
        root_url: &str,
        links: &[FeedLink],
        sink: &BatchSender,
    ) -> Result<CrawlSummary, CrawlError> {
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut summary = CrawlSummary::default();
        let chunk_size = self.config.batch_size.max(1);
        let concurrency = self.config.page_concurrency.max(1);

        for link in links {
            let xml = match self.fetcher.fetch_text(&link.url, &feed_accept(link)).await {
                Ok(xml) => xml,
                Err(e) => {
                    warn!("Failed to fetch feed {}: {}", link.url, e);
                    continue;
                }
            };

            let entries: Vec<FeedEntry> = parse_feed_entries(&xml, root_url)
                .into_iter()
                .filter(|entry| seen_urls.insert(entry.url.clone()))
                .collect();
            if entries.is_empty() {
                warn!("No posts parsed for {}", link.url);
                continue;
            }
            info!("Parsed {} entries from {}", entries.len(), link.url);

            for chunk in entries.chunks(chunk_size) {
                let built: Vec<(RawPost, Vec<AssetDiscovery>)> = stream::iter(chunk)
                    .map(|entry| self.build_post(domain, &link.url, entry))
                    .buffered(concurrency)
                    .collect()
                    .await;

                let mut posts = Vec::with_capacity(built.len());
                let mut assets = Vec::new();
                for (post, post_assets) in built {
                    posts.push(post);
                    assets.extend(post_assets);
                }
                let (post_count, asset_count) = (posts.len(), assets.len());
                sink.send(Batch::new(posts, assets)).await?;
                summary.record(post_count, asset_count);
            }
        }

        Ok(summary)
    }

    /// Fetch an entry's landing page and build its post and asset discoveries.
    async fn build_post(
        &self,
        domain: &str,
        feed_url: &str,
        entry: &FeedEntry,
    ) -> (RawPost, Vec<AssetDiscovery>) {
        let page_html = match self.fetcher.fetch_text(&entry.url, &html_accept()).await {
            Ok(html) => html,
            Err(e) => {
                debug!("Failed to fetch page {}: {}", entry.url, e);
                String::new()
            }
        };

        let post_id = post_id_for_url(&entry.url);
        let created_at = entry
            .created_at
            .or_else(|| extract_page_published_at(&page_html));

        let assets = extract_page_assets(&page_html, &entry.url)
            .into_iter()
            .map(|asset| AssetDiscovery {
                source: RSS_SOURCE.to_string(),
                domain: domain.to_string(),
                post_id: post_id.clone(),
                url: asset.url,
                asset_type: asset.asset_type,
            })
            .collect();

        let post = RawPost {
            domain: domain.to_string(),
            post_id,
            url: entry.url.clone(),
            post_created_at: created_at,
            scraped_at: Utc::now(),
            source: RSS_SOURCE.to_string(),
            request_url: feed_url.to_string(),
            payload: compose_payload(&entry.payload, &page_html),
        };
        (post, assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetType, FeedType};
    use crate::scrapers::http_client::{BodyStream, FetchError};
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MapFetcher {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MapFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }

        fn requested(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == url)
                .count()
        }
    }

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch_text(&self, url: &str, accept: &[String]) -> Result<String, FetchError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), accept.to_vec()));
            self.pages.get(url).cloned().ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }

        async fn open(&self, url: &str) -> Result<Box<dyn BodyStream>, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    const ROOT: &str = r#"<html><head>
        <link rel="alternate" type="application/rss+xml" href="/feed.xml">
        <link rel="alternate" type="application/atom+xml" href="/atom.xml">
        </head><body></body></html>"#;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
        <item><link>https://example.test/a</link><pubDate>Sun, 01 Feb 2026 01:00:00 GMT</pubDate></item>
        <item><link>https://example.test/b</link></item>
        <item><link>https://example.test/c</link></item>
        </channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
        <entry><link rel="alternate" href="https://example.test/b"/></entry>
        <entry><link rel="alternate" href="https://example.test/d"/></entry>
        </feed>"#;

    fn sink() -> (BatchSender, mpsc::Receiver<Option<Batch>>) {
        let (tx, rx) = mpsc::channel(16);
        (BatchSender::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Option<Batch>>) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Ok(Some(batch)) = rx.try_recv() {
            batches.push(batch);
        }
        batches
    }

    fn fetcher() -> MapFetcher {
        MapFetcher::default()
            .with("https://example.test", ROOT)
            .with("https://example.test/feed.xml", RSS)
            .with("https://example.test/atom.xml", ATOM)
            .with(
                "https://example.test/b",
                r#"<html><head><meta property="article:published_time" content="2026-01-05T10:00:00Z"></head>
                <body><article><img src="/img/b.png"><iframe src="https://www.youtube.com/embed/xyz"></iframe></article></body></html>"#,
            )
    }

    #[test]
    fn test_post_id_is_sha256_of_url() {
        assert_eq!(
            post_id_for_url("https://example.test/a"),
            hex::encode(Sha256::digest(b"https://example.test/a"))
        );
        assert_eq!(post_id_for_url("x").len(), 64);
    }

    #[tokio::test]
    async fn test_crawl_domain_discovers_and_caches_feeds() {
        let fetcher = Arc::new(fetcher());
        let crawler = FeedCrawler::new(
            fetcher.clone(),
            FeedCrawlerConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        let cache = FeedLinkCache::new(Arc::new(SqliteStorage::in_memory().unwrap()));
        let (tx, mut rx) = sink();

        let summary = crawler
            .crawl_domain("example.test", &cache, &tx)
            .await
            .unwrap();

        // atom first (b, d), then rss minus the already seen b (a, c)
        let batches = drain(&mut rx);
        let urls: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.posts.iter().map(|p| p.url.as_str()).collect())
            .collect();
        assert_eq!(
            urls,
            vec![
                vec!["https://example.test/b", "https://example.test/d"],
                vec!["https://example.test/a", "https://example.test/c"],
            ]
        );
        assert_eq!(summary.posts, 4);
        assert_eq!(summary.batches, 2);

        let b = &batches[0].posts[0];
        assert_eq!(b.source, "rss");
        assert_eq!(b.request_url, "https://example.test/atom.xml");
        assert_eq!(b.post_id, post_id_for_url("https://example.test/b"));
        assert_eq!(
            b.post_created_at.map(|t| t.to_rfc3339()),
            Some("2026-01-05T10:00:00+00:00".to_string())
        );
        let payload: Value = serde_json::from_str(&b.payload).unwrap();
        assert!(payload["feed_xml"].as_str().unwrap().starts_with("<entry>"));
        assert!(payload["page_html"].as_str().unwrap().contains("<article>"));

        let assets = &batches[0].assets;
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].url, "https://example.test/img/b.png");
        assert_eq!(assets[0].asset_type, AssetType::Image);
        assert_eq!(assets[1].asset_type, AssetType::Youtube);
        assert_eq!(assets[0].post_id, b.post_id);

        // pages that failed to load still yield a post with no page html
        let a = &batches[1].posts[0];
        let payload: Value = serde_json::from_str(&a.payload).unwrap();
        assert_eq!(payload["page_html"], "");
        assert_eq!(
            a.post_created_at.map(|t| t.to_rfc3339()),
            Some("2026-02-01T01:00:00+00:00".to_string())
        );

        let cached = cache.load_all("example.test").await.unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_discovery() {
        let fetcher = Arc::new(fetcher());
        let crawler = FeedCrawler::new(fetcher.clone(), FeedCrawlerConfig::default());
        let cache = FeedLinkCache::new(Arc::new(SqliteStorage::in_memory().unwrap()));
        cache
            .save(
                "example.test",
                &[FeedLink::new(
                    "https://example.test/feed.xml",
                    FeedType::Rss2,
                    None,
                )],
                Utc::now(),
            )
            .await
            .unwrap();
        let (tx, mut rx) = sink();

        let summary = crawler
            .crawl_domain("example.test", &cache, &tx)
            .await
            .unwrap();
        assert_eq!(summary.posts, 3);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(fetcher.requested("https://example.test"), 0);

        let requests = fetcher.requests.lock().unwrap();
        let (_, accept) = requests
            .iter()
            .find(|(u, _)| u == "https://example.test/feed.xml")
            .unwrap();
        assert_eq!(accept[0], "application/rss+xml");
    }

    #[tokio::test]
    async fn test_unreachable_site_yields_nothing() {
        let crawler = FeedCrawler::new(Arc::new(MapFetcher::default()), FeedCrawlerConfig::default());
        let cache = FeedLinkCache::new(Arc::new(SqliteStorage::in_memory().unwrap()));
        let (tx, mut rx) = sink();

        let summary = crawler
            .crawl_domain("down.test", &cache, &tx)
            .await
            .unwrap();
        assert_eq!(summary, CrawlSummary::default());
        assert!(drain(&mut rx).is_empty());
    }
}
