//! X account timeline crawler.
//!
//! Opens an account page, logs in when the site asks for it, then scrolls
//! the timeline while harvesting the GraphQL responses the page fetches.
//! Every scroll step drains the network capture and emits whatever new
//! posts and assets the drained payloads contain.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::login::LoginFlow;
use super::payloads::{extract_posts_from_payload, ExtractedAsset, ExtractedPost};
use super::{CrawlError, CrawlSummary};
use crate::browser::{ensure_navigation, BrowserTab, NetworkCapture};
use crate::models::{AssetDiscovery, Batch, NetworkResponse, RawPost};
use crate::services::ingest::BatchSender;

pub const X_DOMAIN: &str = "x.com";
pub const X_SOURCE: &str = "x";

/// GraphQL operations whose responses carry timeline posts.
pub static CAPTURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(
        r"https://x\.com/i/api/graphql/.+/(UserTweets|UserTweetsAndReplies|TweetDetail|UserMedia)",
    )
    .expect("capture pattern is valid")]
});

/// Short probe used while the timeline keeps producing.
pub const FAST_SCROLL_PAUSE: Duration = Duration::from_millis(350);

/// No drain waits less than this.
pub const MIN_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

const SIGNUP_SELECTOR: &str = r#"a[href="/i/flow/signup"]"#;
const SIGNUP_TIMEOUT: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(10);

const SCROLL_SCRIPT: &str = "(() => {\
const viewport = window.innerHeight || 800;\
const step = Math.max(500, Math.floor(viewport * 1.5));\
const root = document.scrollingElement || document.documentElement;\
const maxTop = Math.max(0, root.scrollHeight - viewport);\
const nextTop = Math.min(root.scrollTop + step, maxTop);\
window.scrollTo(0, nextTop);\
})()";

/// Timeline crawl limits.
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    pub max_posts: usize,
    pub max_scrolls: usize,
    pub scroll_pause: Duration,
    /// Consecutive empty scrolls that end a crawl which already found posts.
    pub idle_scroll_limit: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_posts: 200,
            max_scrolls: 20,
            scroll_pause: Duration::from_millis(1500),
            idle_scroll_limit: 4,
        }
    }
}

/// Drain timeout after a scroll step.
///
/// Probe briefly while scrolls keep yielding, wait the full configured pause
/// once two scrolls in a row came back empty.
pub fn scroll_pause(configured: Duration, idle_scrolls: usize) -> Duration {
    if configured.is_zero() {
        return FAST_SCROLL_PAUSE;
    }
    if idle_scrolls >= 2 {
        return configured;
    }
    configured.min(FAST_SCROLL_PAUSE)
}

fn raw_post(extracted: &ExtractedPost, request_url: &str, scraped_at: DateTime<Utc>) -> RawPost {
    RawPost {
        domain: X_DOMAIN.to_string(),
        post_id: extracted.post_id.clone(),
        url: extracted.url.clone(),
        post_created_at: extracted.created_at,
        scraped_at,
        source: X_SOURCE.to_string(),
        request_url: request_url.to_string(),
        payload: extracted.payload.to_string(),
    }
}

fn asset_discovery(extracted: &ExtractedPost, asset: &ExtractedAsset) -> AssetDiscovery {
    AssetDiscovery {
        source: X_SOURCE.to_string(),
        domain: X_DOMAIN.to_string(),
        post_id: extracted.post_id.clone(),
        url: asset.url.clone(),
        asset_type: asset.asset_type,
    }
}

/// Turn captured responses into new posts and assets.
///
/// Posts already in `seen_posts` are skipped along with their assets; an
/// asset of a new post is kept only if its URL is not in `seen_assets`.
/// Bodies that are not JSON objects are logged and ignored.
pub fn extract_posts_and_assets(
    responses: &[NetworkResponse],
    seen_posts: &mut HashSet<String>,
    seen_assets: &mut HashSet<String>,
    scraped_at: DateTime<Utc>,
) -> (Vec<RawPost>, Vec<AssetDiscovery>) {
    let mut posts = Vec::new();
    let mut assets = Vec::new();

    for response in responses {
        info!(
            "X response request_id={} status={} resource={} mime={} bytes={} url={}",
            response.request_id,
            response.status,
            response.resource_type.as_str(),
            response.mime_type,
            response.body.len(),
            response.url
        );

        let payload: Value = match serde_json::from_str(&response.body) {
            Ok(payload) => payload,
            Err(_) => {
                warn!(
                    "Skipping non-JSON X response request_id={} url={}",
                    response.request_id, response.url
                );
                continue;
            }
        };
        if !payload.is_object() {
            warn!(
                "Skipping non-object X payload request_id={} url={}",
                response.request_id, response.url
            );
            continue;
        }

        let extracted = extract_posts_from_payload(&payload);
        debug!(
            "Parsed {} posts from X response request_id={}",
            extracted.len(),
            response.request_id
        );

        for post in &extracted {
            if !seen_posts.insert(post.post_id.clone()) {
                continue;
            }
            posts.push(raw_post(post, &response.url, scraped_at));
            for asset in &post.assets {
                if seen_assets.insert(asset.url.clone()) {
                    assets.push(asset_discovery(post, asset));
                }
            }
        }
    }

    (posts, assets)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrawlState {
    Navigating,
    LoginCheck,
    LoggingIn,
    Scrolling,
    DrainingTrailing,
    Done,
}

/// Per-account crawl state. Dedup sets never outlive one account.
struct AccountRun {
    seen_posts: HashSet<String>,
    seen_assets: HashSet<String>,
    summary: CrawlSummary,
}

impl AccountRun {
    fn new() -> Self {
        Self {
            seen_posts: HashSet::new(),
            seen_assets: HashSet::new(),
            summary: CrawlSummary::default(),
        }
    }
}

/// Crawls X accounts on one shared tab.
pub struct AccountCrawler<T: BrowserTab + 'static> {
    tab: Arc<T>,
    config: TimelineConfig,
    login: LoginFlow,
    patterns: Vec<Regex>,
}

impl<T: BrowserTab + 'static> AccountCrawler<T> {
    pub fn new(tab: Arc<T>, config: TimelineConfig, login: LoginFlow) -> Self {
        Self {
            tab,
            config,
            login,
            patterns: CAPTURE_PATTERNS.clone(),
        }
    }

    pub fn account_url(handle: &str) -> String {
        format!("https://x.com/{}", urlencoding::encode(handle))
    }

    /// Crawl one account, sending batches to `sink` as they are found.
    pub async fn crawl(&self, account: &str, sink: &BatchSender) -> Result<CrawlSummary, CrawlError> {
        let handle = account.trim_matches('@').trim();
        if handle.is_empty() {
            return Ok(CrawlSummary::default());
        }
        info!("Starting X scrape for account={}", handle);

        let mut capture = NetworkCapture::new(Arc::clone(&self.tab), self.patterns.clone());
        capture.start().await?;

        let url = Self::account_url(handle);
        let mut run = AccountRun::new();
        let result = self.drive(handle, &url, &mut capture, &mut run, sink).await;

        capture.stop();
        info!(
            "Finished X scrape for account={} posts={} assets={}",
            handle, run.summary.posts, run.summary.assets
        );
        result.map(|_| run.summary)
    }

    async fn drive(
        &self,
        handle: &str,
        url: &str,
        capture: &mut NetworkCapture<T>,
        run: &mut AccountRun,
        sink: &BatchSender,
    ) -> Result<(), CrawlError> {
        let mut state = CrawlState::Navigating;
        let mut logged_in = false;

        while state != CrawlState::Done {
            debug!("Account {} entering {:?}", handle, state);
            state = match state {
                CrawlState::Navigating => {
                    ensure_navigation(self.tab.as_ref(), url, READY_TIMEOUT).await?;
                    if logged_in {
                        CrawlState::Scrolling
                    } else {
                        CrawlState::LoginCheck
                    }
                }
                CrawlState::LoginCheck => {
                    if self.is_login_page().await {
                        CrawlState::LoggingIn
                    } else {
                        CrawlState::Scrolling
                    }
                }
                CrawlState::LoggingIn => {
                    self.login.login(self.tab.as_ref()).await?;
                    logged_in = true;
                    CrawlState::Navigating
                }
                CrawlState::Scrolling => self.scroll(handle, capture, run, sink).await?,
                CrawlState::DrainingTrailing => {
                    let timeout = self.config.scroll_pause.min(FAST_SCROLL_PAUSE);
                    let (posts, assets) = self.drain_and_emit(capture, run, sink, timeout).await?;
                    info!(
                        "Trailing drain for {} produced posts={} assets={} total_posts={}",
                        handle, posts, assets, run.summary.posts
                    );
                    CrawlState::Done
                }
                CrawlState::Done => CrawlState::Done,
            };
        }
        Ok(())
    }

    /// Initial drain plus the scroll loop. Returns the next state.
    async fn scroll(
        &self,
        handle: &str,
        capture: &mut NetworkCapture<T>,
        run: &mut AccountRun,
        sink: &BatchSender,
    ) -> Result<CrawlState, CrawlError> {
        let (posts, assets) = self
            .drain_and_emit(capture, run, sink, self.config.scroll_pause)
            .await?;
        info!(
            "Initial drain for {} produced posts={} assets={}",
            handle, posts, assets
        );
        if run.summary.posts >= self.config.max_posts {
            return Ok(CrawlState::Done);
        }

        let mut idle_scrolls = 0;
        for _ in 0..self.config.max_scrolls {
            self.tab.evaluate(SCROLL_SCRIPT).await?;

            let timeout = scroll_pause(self.config.scroll_pause, idle_scrolls);
            let (posts, assets) = self.drain_and_emit(capture, run, sink, timeout).await?;
            info!(
                "Scroll drain for {} produced posts={} assets={} idle={}",
                handle, posts, assets, idle_scrolls
            );

            if posts > 0 || assets > 0 {
                idle_scrolls = 0;
            } else {
                idle_scrolls += 1;
            }

            if run.summary.posts >= self.config.max_posts {
                break;
            }
            if idle_scrolls >= self.config.idle_scroll_limit && run.summary.posts > 0 {
                break;
            }
        }

        Ok(CrawlState::DrainingTrailing)
    }

    /// Drain the capture, extract, and emit a batch if anything is new.
    async fn drain_and_emit(
        &self,
        capture: &mut NetworkCapture<T>,
        run: &mut AccountRun,
        sink: &BatchSender,
        timeout: Duration,
    ) -> Result<(usize, usize), CrawlError> {
        let responses = capture.drain(timeout.max(MIN_DRAIN_TIMEOUT)).await;
        debug!("Drained {} X network responses", responses.len());

        let (posts, assets) = extract_posts_and_assets(
            &responses,
            &mut run.seen_posts,
            &mut run.seen_assets,
            Utc::now(),
        );
        let counts = (posts.len(), assets.len());
        if counts.0 > 0 || counts.1 > 0 {
            sink.send(Batch::new(posts, assets)).await?;
            run.summary.record(counts.0, counts.1);
        }
        Ok(counts)
    }

    async fn is_login_page(&self) -> bool {
        if let Some(location) = self.tab.location().await {
            if location.contains("/i/flow/login") || location.contains("/login") {
                return true;
            }
        }
        matches!(
            self.tab.select(SIGNUP_SELECTOR, SIGNUP_TIMEOUT).await,
            Ok(Some(_))
        )
    }
}
