//! Browser driver surface used by the timeline crawler.
//!
//! The crawler and login flow only see [`BrowserTab`]: navigation, DOM
//! query and input, script evaluation and network-event subscription.
//! [`chromium`] provides the real driver; tests use an in-process fake.

pub mod capture;
#[cfg(feature = "browser")]
pub mod chromium;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub use capture::NetworkCapture;
#[cfg(feature = "browser")]
pub use chromium::{ChromiumSession, ChromiumTab};

use crate::models::ResourceKind;

/// Executables tried, in order, when none is configured.
pub const BROWSER_CANDIDATES: [&str; 8] = [
    "thorium-browser",
    "thorium",
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "brave-browser",
    "brave",
];

const READY_POLL: Duration = Duration::from_millis(100);

/// Browser-level failures.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("No browser executable found (tried {0})")]
    ExecutableNotFound(String),
    #[error("Failed to launch browser: {0}")]
    Launch(String),
    #[error("Browser command failed: {0}")]
    Command(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

#[cfg(feature = "browser")]
impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::Command(e.to_string())
    }
}

/// Network events the capture layer consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ResponseReceived {
        request_id: String,
        url: String,
        status: i64,
        mime_type: String,
        resource_type: ResourceKind,
    },
    LoadingFinished {
        request_id: String,
    },
}

/// A response body as the browser reports it.
#[derive(Debug, Clone, Default)]
pub struct ResponseBody {
    pub body: String,
    pub base64_encoded: bool,
}

/// A single browser tab.
#[async_trait]
pub trait BrowserTab: Send + Sync {
    /// Handle to a DOM element found by [`BrowserTab::select`].
    type Element: Send + Sync;

    /// Navigate and wait for the load to commit.
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Run a script and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError>;

    /// First element matching `selector`, polling until `timeout` elapses.
    async fn select(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<Self::Element>, BrowserError>;

    /// Type text into an element.
    async fn send_keys(&self, element: &Self::Element, text: &str) -> Result<(), BrowserError>;

    /// Press Enter inside an element.
    async fn press_enter(&self, element: &Self::Element) -> Result<(), BrowserError>;

    async fn click(&self, element: &Self::Element) -> Result<(), BrowserError>;

    /// Move the pointer to a viewport position in `steps` increments.
    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> Result<(), BrowserError>;

    /// Viewport position of an element's center.
    async fn element_center(&self, element: &Self::Element) -> Result<(f64, f64), BrowserError>;

    /// Subscribe to response-received and loading-finished events.
    async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, BrowserError>;

    /// Body of a finished response.
    async fn response_body(&self, request_id: &str) -> Result<ResponseBody, BrowserError>;

    /// Current `location.href`, `None` when it cannot be read.
    async fn location(&self) -> Option<String> {
        match self.evaluate("location.href").await {
            Ok(Value::String(location)) => Some(location),
            _ => None,
        }
    }

    /// Wait for `document.readyState` to reach `complete`.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Value::String(state)) = self.evaluate("document.readyState").await {
                if state == "complete" {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout("document ready".to_string()));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Viewport size as `(width, height)`, zero when unavailable.
    async fn viewport(&self) -> (f64, f64) {
        let value = self
            .evaluate("({width: window.innerWidth, height: window.innerHeight})")
            .await
            .unwrap_or_default();
        let dimension = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        (dimension("width"), dimension("height"))
    }
}

/// Navigate to `url` and make sure the tab actually left `about:blank`.
pub async fn ensure_navigation<T: BrowserTab + ?Sized>(
    tab: &T,
    url: &str,
    ready_timeout: Duration,
) -> Result<(), BrowserError> {
    tab.goto(url).await?;
    let _ = tab.wait_for_ready(ready_timeout).await;

    match tab.location().await.as_deref() {
        Some(location) if !location.is_empty() && location != "about:blank" => Ok(()),
        _ => {
            debug!("Navigation to {} did not commit; retrying", url);
            tab.goto(url).await?;
            let _ = tab.wait_for_ready(ready_timeout).await;
            Ok(())
        }
    }
}

/// Owner of a browser process that hands out tabs.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    type Tab: BrowserTab + 'static;

    /// Open a tab, launching the browser on first use.
    async fn new_tab(&self) -> Result<Self::Tab, BrowserError>;

    /// Keep the browser alive for inspection after a failed headed run.
    async fn hold_open(&self);

    async fn close(&self);
}

/// Options for launching the browser.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub user_data_dir: PathBuf,
    pub connection_timeout: Duration,
    pub connection_max_tries: u32,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            user_data_dir: PathBuf::from("data/browser-profile"),
            connection_timeout: Duration::from_secs(10),
            connection_max_tries: 3,
        }
    }
}

/// Resolve the browser binary: the configured path if it exists, else the
/// first candidate on `PATH`.
pub fn find_browser_executable(configured: Option<&Path>) -> Result<PathBuf, BrowserError> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if let Ok(found) = which::which(path) {
            return Ok(found);
        }
        return Err(BrowserError::ExecutableNotFound(path.display().to_string()));
    }

    BROWSER_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| BrowserError::ExecutableNotFound(BROWSER_CANDIDATES.join(", ")))
}
