//! Configuration management for dank using the prefer crate.
//!
//! `Config` mirrors the file layout with every field optional; `Settings` is
//! the resolved runtime view with defaults filled in. Sources are resolved
//! into [`SourceKind`] values at load time.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain served by the timeline crawler.
pub const TIMELINE_DOMAIN: &str = "x.com";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid source: {0}")]
    InvalidSource(String),
}

/// A configured source, resolved to the crawler that handles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Browser-driven X account timelines.
    Timeline { accounts: Vec<String> },
    /// RSS/Atom discoverable site.
    Feed { domain: String },
}

impl SourceKind {
    pub fn domain(&self) -> &str {
        match self {
            SourceKind::Timeline { .. } => TIMELINE_DOMAIN,
            SourceKind::Feed { domain } => domain,
        }
    }
}

/// X credentials and crawl limits.
#[derive(Debug, Clone)]
pub struct XSettings {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub max_posts: usize,
    pub max_scrolls: usize,
    pub scroll_pause: Duration,
    pub idle_scroll_limit: usize,
}

impl Default for XSettings {
    fn default() -> Self {
        Self {
            username: None,
            email: None,
            password: None,
            max_posts: 200,
            max_scrolls: 20,
            scroll_pause: Duration::from_millis(1500),
            idle_scroll_limit: 4,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root of downloaded assets.
    pub assets_dir: PathBuf,
    /// Largest asset kept on disk, `None` for unlimited.
    pub max_asset_bytes: Option<u64>,
    pub asset_concurrency: usize,
    /// Records per storage flush.
    pub batch_size: usize,
    /// Batches buffered between crawlers and the pipeline.
    pub queue_capacity: usize,
    /// User agent for HTTP requests ("impersonate" picks a browser UA).
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Delay between requests in milliseconds.
    pub request_delay_ms: u64,
    pub headless: bool,
    pub x: XSettings,
    pub feed_staleness_days: i64,
    pub page_concurrency: usize,
    pub browser_executable: Option<PathBuf>,
    pub browser_connection_timeout: Duration,
    pub browser_connection_max_tries: u32,
    /// Maildir polled for one-time login codes.
    pub maildir: Option<PathBuf>,
    pub email_timeout: Duration,
    pub email_poll_interval: Duration,
    pub log_level: String,
    /// Log file, `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    pub sources: Vec<SourceKind>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        // Fall back to the conventional mailbox when one exists.
        let maildir = dirs::home_dir()
            .map(|home| home.join("Maildir"))
            .filter(|path| path.is_dir());

        Self {
            database_path: data_dir.join("dank.db"),
            assets_dir: data_dir.join("assets"),
            max_asset_bytes: None,
            asset_concurrency: 4,
            batch_size: 50,
            queue_capacity: 8,
            user_agent: None,
            request_timeout: 30,
            request_delay_ms: 0,
            headless: false,
            x: XSettings::default(),
            feed_staleness_days: 14,
            page_concurrency: 4,
            browser_executable: None,
            browser_connection_timeout: Duration::from_secs(10),
            browser_connection_max_tries: 3,
            maildir,
            email_timeout: Duration::from_secs(120),
            email_poll_interval: Duration::from_secs(5),
            log_level: "info".to_string(),
            log_file: Some(PathBuf::from("dank.log")),
            sources: Vec::new(),
        }
    }
}

impl Settings {
    /// Browser profile directory, kept next to the assets directory.
    pub fn browser_profile_dir(&self) -> PathBuf {
        self.assets_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join("browser-profile")
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.assets_dir)?;
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Whether any configured source needs the browser.
    pub fn has_timeline_source(&self) -> bool {
        self.sources
            .iter()
            .any(|source| matches!(source, SourceKind::Timeline { .. }))
    }
}

/// `[x]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub max_posts: Option<usize>,
    #[serde(default)]
    pub max_scrolls: Option<usize>,
    #[serde(default)]
    pub scroll_pause_seconds: Option<f64>,
    #[serde(default)]
    pub idle_scroll_limit: Option<usize>,
}

/// `[rss]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RssConfig {
    #[serde(default)]
    pub feed_staleness_days: Option<i64>,
    #[serde(default)]
    pub page_concurrency: Option<usize>,
}

/// `[browser]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub executable_path: Option<String>,
    /// Seconds to wait for the browser to come up.
    #[serde(default)]
    pub connection_timeout: Option<u64>,
    #[serde(default)]
    pub connection_max_tries: Option<u32>,
}

/// `[email]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub maildir: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub poll_seconds: Option<u64>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    /// Empty string disables file output.
    #[serde(default)]
    pub file: Option<String>,
}

/// One `sources` entry: a bare domain or a table with accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Domain(String),
    Detailed {
        #[serde(default)]
        domain: Option<String>,
        #[serde(default)]
        accounts: Vec<String>,
    },
}

impl SourceEntry {
    /// Resolve this entry to the crawler that handles it.
    pub fn resolve(&self) -> Result<SourceKind, ConfigError> {
        let (domain, accounts) = match self {
            SourceEntry::Domain(domain) => (Some(domain.as_str()), &[][..]),
            SourceEntry::Detailed { domain, accounts } => (domain.as_deref(), accounts.as_slice()),
        };
        let domain = domain
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ConfigError::InvalidSource("source entry without a domain".to_string()))?;

        if domain != TIMELINE_DOMAIN {
            return Ok(SourceKind::Feed { domain });
        }
        let accounts: Vec<String> = accounts
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if accounts.is_empty() {
            return Err(ConfigError::InvalidSource(format!(
                "{} needs at least one account",
                TIMELINE_DOMAIN
            )));
        }
        Ok(SourceKind::Timeline { accounts })
    }
}

/// Deserialize a nested section of a prefer config with serde.
fn section<T: serde::de::DeserializeOwned + Default>(pref_config: &prefer::Config, key: &str) -> T {
    let Ok(value) = pref_config.get_value(key) else {
        return T::default();
    };
    match serde_json::from_value(to_json(value)) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Ignoring config section {}: {}", key, e);
            T::default()
        }
    }
}

fn to_json(value: &prefer::ConfigValue) -> serde_json::Value {
    use prefer::ConfigValue;
    use serde_json::Value;

    match value {
        ConfigValue::Null => Value::Null,
        ConfigValue::Bool(b) => Value::Bool(*b),
        ConfigValue::Integer(i) => Value::from(*i),
        ConfigValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ConfigValue::String(s) => Value::String(s.clone()),
        ConfigValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        ConfigValue::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub assets_dir: Option<String>,
    #[serde(default)]
    pub max_asset_bytes: Option<u64>,
    #[serde(default)]
    pub asset_concurrency: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub x: XConfig,
    #[serde(default)]
    pub rss: RssConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers dank config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("dank").await {
            Ok(pref_config) => Self::from_prefer(&pref_config),
            Err(_) => {
                // No config file found, use defaults
                Self::default()
            }
        }
    }

    /// Extract values from a prefer config using dot notation. Sections that
    /// fail to convert fall back to their defaults.
    pub fn from_prefer(pref_config: &prefer::Config) -> Self {
        Config {
            database: pref_config.get("database").ok(),
            assets_dir: pref_config.get("assets_dir").ok(),
            max_asset_bytes: pref_config.get("max_asset_bytes").ok(),
            asset_concurrency: pref_config.get("asset_concurrency").ok(),
            batch_size: pref_config.get("batch_size").ok(),
            queue_capacity: pref_config.get("queue_capacity").ok(),
            user_agent: pref_config.get("user_agent").ok(),
            request_timeout: pref_config.get("request_timeout").ok(),
            request_delay_ms: pref_config.get("request_delay_ms").ok(),
            x: section(pref_config, "x"),
            rss: section(pref_config, "rss"),
            browser: section(pref_config, "browser"),
            email: section(pref_config, "email"),
            logging: section(pref_config, "logging"),
            sources: section(pref_config, "sources"),
        }
    }

    /// Load an explicit TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply configuration to settings, resolving sources.
    pub fn apply_to_settings(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(ref database) = self.database {
            settings.database_path = expand_path(database);
        }
        if let Some(ref assets_dir) = self.assets_dir {
            settings.assets_dir = expand_path(assets_dir);
        }
        if let Some(limit) = self.max_asset_bytes {
            settings.max_asset_bytes = Some(limit);
        }
        if let Some(concurrency) = self.asset_concurrency {
            settings.asset_concurrency = concurrency.max(1);
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = batch_size.max(1);
        }
        if let Some(capacity) = self.queue_capacity {
            settings.queue_capacity = capacity.max(1);
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(delay) = self.request_delay_ms {
            settings.request_delay_ms = delay;
        }

        let x = &self.x;
        if x.username.is_some() {
            settings.x.username = x.username.clone();
        }
        if x.email.is_some() {
            settings.x.email = x.email.clone();
        }
        if x.password.is_some() {
            settings.x.password = x.password.clone();
        }
        if let Some(max_posts) = x.max_posts {
            settings.x.max_posts = max_posts;
        }
        if let Some(max_scrolls) = x.max_scrolls {
            settings.x.max_scrolls = max_scrolls;
        }
        if let Some(pause) = x.scroll_pause_seconds.filter(|p| p.is_finite() && *p >= 0.0) {
            settings.x.scroll_pause = Duration::from_secs_f64(pause);
        }
        if let Some(limit) = x.idle_scroll_limit {
            settings.x.idle_scroll_limit = limit;
        }

        if let Some(days) = self.rss.feed_staleness_days {
            settings.feed_staleness_days = days;
        }
        if let Some(concurrency) = self.rss.page_concurrency {
            settings.page_concurrency = concurrency.max(1);
        }

        if let Some(ref path) = self.browser.executable_path {
            settings.browser_executable = Some(expand_path(path));
        }
        if let Some(timeout) = self.browser.connection_timeout {
            settings.browser_connection_timeout = Duration::from_secs(timeout);
        }
        if let Some(tries) = self.browser.connection_max_tries {
            settings.browser_connection_max_tries = tries.max(1);
        }

        if let Some(ref maildir) = self.email.maildir {
            settings.maildir = Some(expand_path(maildir)).filter(|_| !maildir.is_empty());
        }
        if let Some(timeout) = self.email.timeout_seconds {
            settings.email_timeout = Duration::from_secs(timeout);
        }
        if let Some(poll) = self.email.poll_seconds {
            settings.email_poll_interval = Duration::from_secs(poll.max(1));
        }

        if let Some(ref level) = self.logging.level {
            settings.log_level = level.clone();
        }
        if let Some(ref file) = self.logging.file {
            settings.log_file = if file.is_empty() {
                None
            } else {
                Some(expand_path(file))
            };
        }

        if !self.sources.is_empty() {
            settings.sources = self
                .sources
                .iter()
                .map(SourceEntry::resolve)
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }
}

/// Load settings, from `path` when given, otherwise from discovered config.
pub async fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load().await,
    };
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database = "/tmp/dank-test/dank.db"
assets_dir = "/tmp/dank-test/assets"
max_asset_bytes = 1048576
batch_size = 0

[x]
username = "archivist"
password = "hunter2"
scroll_pause_seconds = 0.5

[rss]
feed_staleness_days = 7

[logging]
file = ""
"#;

    #[test]
    fn test_apply_overrides_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();

        assert_eq!(settings.database_path, PathBuf::from("/tmp/dank-test/dank.db"));
        assert_eq!(settings.max_asset_bytes, Some(1_048_576));
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.x.username.as_deref(), Some("archivist"));
        assert_eq!(settings.x.scroll_pause, Duration::from_millis(500));
        assert_eq!(settings.x.max_posts, 200);
        assert_eq!(settings.feed_staleness_days, 7);
        assert_eq!(settings.log_file, None);
        assert_eq!(
            settings.browser_profile_dir(),
            PathBuf::from("/tmp/dank-test/browser-profile")
        );
    }

    #[test]
    fn test_sources_resolve_by_domain() {
        let config = Config::from_toml(
            r#"
sources = [
  "Example.COM",
  { domain = "x.com", accounts = ["@nasa", " "] },
  { domain = "blog.test", accounts = ["ignored"] },
]
"#,
        )
        .unwrap();
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();

        assert_eq!(
            settings.sources,
            vec![
                SourceKind::Feed {
                    domain: "example.com".to_string()
                },
                SourceKind::Timeline {
                    accounts: vec!["@nasa".to_string()]
                },
                SourceKind::Feed {
                    domain: "blog.test".to_string()
                },
            ]
        );
        assert!(settings.has_timeline_source());
    }

    #[test]
    fn test_invalid_sources_are_rejected() {
        for toml in [
            r#"sources = [{ accounts = ["a"] }]"#,
            r#"sources = ["x.com"]"#,
            r#"sources = [{ domain = "X.com", accounts = [] }]"#,
        ] {
            let config = Config::from_toml(toml).unwrap();
            let mut settings = Settings::default();
            assert!(matches!(
                config.apply_to_settings(&mut settings),
                Err(ConfigError::InvalidSource(_))
            ));
        }
    }

    #[test]
    fn test_prefer_values_fill_config() {
        use prefer::ConfigValue;
        use std::collections::HashMap;

        let object = |pairs: Vec<(&str, ConfigValue)>| {
            ConfigValue::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect::<HashMap<_, _>>(),
            )
        };
        let data = object(vec![
            ("batch_size", ConfigValue::Integer(25)),
            ("user_agent", ConfigValue::String("dank-test".to_string())),
            (
                "x",
                object(vec![
                    ("max_scrolls", ConfigValue::Integer(7)),
                    ("scroll_pause_seconds", ConfigValue::Float(0.5)),
                ]),
            ),
            (
                "sources",
                ConfigValue::Array(vec![
                    ConfigValue::String("Example.COM".to_string()),
                    object(vec![
                        ("domain", ConfigValue::String("x.com".to_string())),
                        (
                            "accounts",
                            ConfigValue::Array(vec![ConfigValue::String("nasa".to_string())]),
                        ),
                    ]),
                ]),
            ),
            ("logging", ConfigValue::String("not a table".to_string())),
        ]);

        let config = Config::from_prefer(&prefer::Config::new(data));
        assert_eq!(config.batch_size, Some(25));
        assert_eq!(config.user_agent.as_deref(), Some("dank-test"));
        assert_eq!(config.database, None);
        assert_eq!(config.x.max_scrolls, Some(7));
        assert_eq!(config.sources.len(), 2);

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.x.max_scrolls, 7);
        assert_eq!(settings.x.scroll_pause, Duration::from_millis(500));
        assert_eq!(
            settings.sources,
            vec![
                SourceKind::Feed {
                    domain: "example.com".to_string()
                },
                SourceKind::Timeline {
                    accounts: vec!["nasa".to_string()]
                },
            ]
        );
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml("batch_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
