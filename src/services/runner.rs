//! Run orchestration: crawls every configured source in order and feeds the
//! ingestion pipeline, which is always shut down with a final flush.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use super::assets::{AssetResolver, AssetResolverConfig};
use super::ingest::{BatchSender, DomainCounts, IngestionPipeline};
use crate::browser::{BrowserOptions, BrowserSession};
use crate::config::{Settings, SourceKind};
use crate::otp::MaildirCodeOracle;
use crate::scrapers::{
    AccountCrawler, CrawlError, CrawlSummary, FeedCrawler, FeedCrawlerConfig, Fetcher,
    LoginCredentials, LoginFlow, TimelineConfig,
};
use crate::storage::{FeedLinkCache, Storage, StorageError};

/// Failures that prevent a run from starting.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] crate::scrapers::FetchError),
}

/// Outcome of one crawled account or feed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    /// Domain, or `x.com/<account>` for timelines.
    pub source: String,
    pub summary: CrawlSummary,
    pub error: Option<String>,
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub sources: Vec<SourceOutcome>,
    /// Rows written per domain.
    pub counts: BTreeMap<String, DomainCounts>,
    /// First fatal or login error.
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn record(&mut self, source: String, result: Result<CrawlSummary, &CrawlError>) {
        let (summary, error) = match result {
            Ok(summary) => (summary, None),
            Err(e) => (CrawlSummary::default(), Some(e.to_string())),
        };
        self.sources.push(SourceOutcome {
            source,
            summary,
            error,
        });
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

/// Drives one scrape run over the configured sources.
pub struct Runner {
    settings: Settings,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetcher>,
}

impl Runner {
    pub fn new(settings: Settings, storage: Arc<dyn Storage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            settings,
            storage,
            fetcher,
        }
    }

    fn login_flow(&self) -> LoginFlow {
        let x = &self.settings.x;
        let credentials = match (&x.username, &x.password) {
            (Some(username), Some(password)) => Some(LoginCredentials {
                username: username.clone(),
                email: x.email.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let flow = LoginFlow::new(credentials);
        match &self.settings.maildir {
            Some(maildir) => flow.with_oracle(
                Arc::new(MaildirCodeOracle::new(
                    maildir.clone(),
                    self.settings.email_poll_interval,
                )),
                self.settings.email_timeout,
            ),
            None => flow,
        }
    }

    fn timeline_config(&self) -> TimelineConfig {
        let x = &self.settings.x;
        TimelineConfig {
            max_posts: x.max_posts,
            max_scrolls: x.max_scrolls,
            scroll_pause: x.scroll_pause,
            idle_scroll_limit: x.idle_scroll_limit,
        }
    }

    fn feed_crawler(&self) -> FeedCrawler {
        FeedCrawler::new(
            Arc::clone(&self.fetcher),
            FeedCrawlerConfig {
                batch_size: self.settings.batch_size,
                page_concurrency: self.settings.page_concurrency,
                feed_staleness: chrono::Duration::days(self.settings.feed_staleness_days),
            },
        )
    }

    /// Run every source. Storage must answer a probe before anything starts;
    /// after that, failures are recorded in the report and the pipeline is
    /// always flushed.
    pub async fn run<S: BrowserSession>(&self, session: &S) -> Result<RunReport, RunError> {
        self.storage.fetch_rows("SELECT 1", Vec::new()).await?;
        tokio::fs::create_dir_all(&self.settings.assets_dir).await?;

        let resolver = AssetResolver::new(
            Arc::clone(&self.fetcher),
            AssetResolverConfig {
                assets_dir: self.settings.assets_dir.clone(),
                max_asset_bytes: self.settings.max_asset_bytes,
                concurrency: self.settings.asset_concurrency,
            },
        );
        let (sender, pipeline) = IngestionPipeline::start(
            Arc::clone(&self.storage),
            resolver,
            self.settings.batch_size,
            self.settings.queue_capacity,
        );

        let mut report = RunReport::default();
        self.crawl_sources(session, &sender, &mut report).await;
        drop(sender);

        match pipeline.finish().await {
            Ok(ingested) => report.counts = ingested.domains,
            Err(e) => {
                error!("Ingestion failed: {}", e);
                report.fail(format!("Ingestion failed: {}", e));
            }
        }

        if !report.is_success() && !self.settings.headless {
            session.hold_open().await;
        }
        session.close().await;

        info!(
            "Run finished: {} sources, {} posts written",
            report.sources.len(),
            report.counts.values().map(|c| c.posts).sum::<usize>()
        );
        Ok(report)
    }

    async fn crawl_sources<S: BrowserSession>(
        &self,
        session: &S,
        sender: &BatchSender,
        report: &mut RunReport,
    ) {
        let cache = FeedLinkCache::new(Arc::clone(&self.storage));
        let feeds = self.feed_crawler();
        let mut timeline: Option<AccountCrawler<S::Tab>> = None;

        for source in &self.settings.sources {
            match source {
                SourceKind::Feed { domain } => {
                    info!("Crawling feeds for {}", domain);
                    let result = feeds.crawl_domain(domain, &cache, sender).await;
                    if self.settle(domain.clone(), result, report) {
                        return;
                    }
                }
                SourceKind::Timeline { accounts } => {
                    if timeline.is_none() {
                        match session.new_tab().await {
                            Ok(tab) => {
                                timeline = Some(AccountCrawler::new(
                                    Arc::new(tab),
                                    self.timeline_config(),
                                    self.login_flow(),
                                ));
                            }
                            Err(e) => {
                                warn!("Browser unavailable, skipping timeline accounts: {}", e);
                                let e = CrawlError::Browser(e);
                                report.fail(e.to_string());
                                report.record(source.domain().to_string(), Err(&e));
                                continue;
                            }
                        }
                    }
                    let Some(crawler) = timeline.as_ref() else {
                        continue;
                    };
                    for account in accounts {
                        let result = crawler.crawl(account, sender).await;
                        let label = format!("{}/{}", source.domain(), account.trim_matches('@'));
                        if self.settle(label, result, report) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Record a crawl result. Returns true when the run must stop.
    fn settle(
        &self,
        source: String,
        result: Result<CrawlSummary, CrawlError>,
        report: &mut RunReport,
    ) -> bool {
        match result {
            Ok(summary) => {
                report.record(source, Ok(summary));
                false
            }
            Err(e) => {
                if e.is_fatal() {
                    error!("Crawl of {} failed: {}", source, e);
                } else {
                    warn!("Crawl of {} failed: {}", source, e);
                }
                if e.is_fatal() || matches!(e, CrawlError::Login(_)) {
                    report.fail(e.to_string());
                }
                report.record(source, Err(&e));
                e.is_fatal()
            }
        }
    }
}

/// Browser launch options derived from settings.
pub fn browser_options(settings: &Settings) -> BrowserOptions {
    BrowserOptions {
        executable_path: settings.browser_executable.clone(),
        headless: settings.headless,
        user_data_dir: settings.browser_profile_dir(),
        connection_timeout: settings.browser_connection_timeout,
        connection_max_tries: settings.browser_connection_max_tries,
    }
}

/// Open the configured database and run every source with a Chromium
/// session that is only launched if a timeline source needs it.
#[cfg(feature = "browser")]
pub async fn run_scrape(settings: &Settings) -> Result<RunReport, RunError> {
    use std::time::Duration;

    use crate::browser::chromium::ChromiumSession;
    use crate::scrapers::HttpClient;
    use crate::storage::SqliteStorage;

    settings.ensure_directories()?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&settings.database_path)?);
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpClient::new(
        settings.user_agent.as_deref(),
        Duration::from_secs(settings.request_timeout),
        Duration::from_millis(settings.request_delay_ms),
    )?);
    let session = ChromiumSession::new(browser_options(settings));

    info!(
        "Starting scrape of {} sources (database {})",
        settings.sources.len(),
        settings.database_path.display()
    );
    Runner::new(settings.clone(), storage, fetcher)
        .run(&session)
        .await
}
