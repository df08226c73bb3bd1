//! Chromium driver using chromiumoxide.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams, RequestId,
    ResourceType,
};
use chromiumoxide::element::Element;
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use futures::stream::{self, BoxStream, PollNext};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{
    find_browser_executable, BrowserError, BrowserOptions, BrowserSession, BrowserTab,
    NetworkEvent, ResponseBody,
};
use crate::models::ResourceKind;

const SELECT_POLL: Duration = Duration::from_millis(100);

fn resource_kind(resource_type: &ResourceType) -> ResourceKind {
    match resource_type {
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        ResourceType::Document => ResourceKind::Document,
        _ => ResourceKind::Other,
    }
}

/// A chromiumoxide page.
pub struct ChromiumTab {
    page: Page,
}

impl ChromiumTab {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl BrowserTab for ChromiumTab {
    type Element = Element;

    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn select(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<Element>, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(element) = self.page.find_element(selector).await {
                return Ok(Some(element));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SELECT_POLL).await;
        }
    }

    async fn send_keys(&self, element: &Element, text: &str) -> Result<(), BrowserError> {
        element.type_str(text).await?;
        Ok(())
    }

    async fn press_enter(&self, element: &Element) -> Result<(), BrowserError> {
        element.press_key("Enter").await?;
        Ok(())
    }

    async fn click(&self, element: &Element) -> Result<(), BrowserError> {
        element.click().await?;
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64, steps: u32) -> Result<(), BrowserError> {
        // CDP moves the pointer in one jump; interpolate from the viewport center.
        let (width, height) = self.viewport().await;
        let (start_x, start_y) = (width / 2.0, height / 2.0);
        let steps = steps.max(1);
        for step in 1..=steps {
            let t = f64::from(step) / f64::from(steps);
            let point = Point::new(start_x + (x - start_x) * t, start_y + (y - start_y) * t);
            self.page.move_mouse(point).await?;
        }
        Ok(())
    }

    async fn element_center(&self, element: &Element) -> Result<(f64, f64), BrowserError> {
        let point = element.clickable_point().await?;
        Ok((point.x, point.y))
    }

    async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, BrowserError> {
        self.page.execute(EnableParams::default()).await?;

        let received = self
            .page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(|event| NetworkEvent::ResponseReceived {
                request_id: event.request_id.inner().clone(),
                url: event.response.url.clone(),
                status: event.response.status,
                mime_type: event.response.mime_type.clone(),
                resource_type: resource_kind(&event.r#type),
            });
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(|event| NetworkEvent::LoadingFinished {
                request_id: event.request_id.inner().clone(),
            });

        // A response is always announced before its load finishes.
        let merged = stream::select_with_strategy(received, finished, |_: &mut ()| PollNext::Left);
        Ok(merged.boxed())
    }

    async fn response_body(&self, request_id: &str) -> Result<ResponseBody, BrowserError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await?;
        Ok(ResponseBody {
            body: response.result.body.clone(),
            base64_encoded: response.result.base64_encoded,
        })
    }
}

struct Running {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// Lazily launched Chromium process shared across accounts.
pub struct ChromiumSession {
    options: BrowserOptions,
    running: Mutex<Option<Running>>,
}

impl ChromiumSession {
    pub fn new(options: BrowserOptions) -> Self {
        Self {
            options,
            running: Mutex::new(None),
        }
    }

    fn config(&self) -> Result<BrowserConfig, BrowserError> {
        let executable = find_browser_executable(self.options.executable_path.as_deref())?;
        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .user_data_dir(&self.options.user_data_dir)
            .launch_timeout(self.options.connection_timeout)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage");
        if !self.options.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(BrowserError::Launch)
    }

    async fn launch(&self) -> Result<Running, BrowserError> {
        std::fs::create_dir_all(&self.options.user_data_dir)
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let tries = self.options.connection_max_tries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=tries {
            let config = self.config()?;
            match Browser::launch(config).await {
                Ok((browser, mut handler)) => {
                    let handler = tokio::spawn(async move {
                        while let Some(h) = handler.next().await {
                            if h.is_err() {
                                break;
                            }
                        }
                    });
                    info!(
                        "Browser launched (headless={}, profile={})",
                        self.options.headless,
                        self.options.user_data_dir.display()
                    );
                    return Ok(Running { browser, handler });
                }
                Err(e) => {
                    warn!("Browser launch attempt {}/{} failed: {}", attempt, tries, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(BrowserError::Launch(last_error))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    type Tab = ChromiumTab;

    async fn new_tab(&self) -> Result<ChromiumTab, BrowserError> {
        let mut running = self.running.lock().await;
        if running.is_none() {
            *running = Some(self.launch().await?);
        }
        let Some(session) = running.as_ref() else {
            return Err(BrowserError::Launch("browser not running".to_string()));
        };
        let page = session.browser.new_page("about:blank").await?;
        Ok(ChromiumTab::new(page))
    }

    async fn hold_open(&self) {
        if self.options.headless || self.running.lock().await.is_none() {
            return;
        }
        warn!("Run failed; holding the browser open for inspection. Press Ctrl-C to exit.");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to wait for Ctrl-C: {}", e);
        }
    }

    async fn close(&self) {
        let Some(mut session) = self.running.lock().await.take() else {
            return;
        };
        if let Err(e) = session.browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
        let _ = session.browser.wait().await;
        session.handler.abort();
    }
}
