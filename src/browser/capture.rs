//! Network response capture.
//!
//! Watches a tab's network events, keeps the metadata of responses whose URL
//! matches one of the capture patterns, and once the body has finished
//! loading pushes a [`NetworkResponse`] onto a bounded queue. The crawler
//! collects queued responses with [`NetworkCapture::drain`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BrowserError, BrowserTab, NetworkEvent};
use crate::models::{NetworkResponse, ResourceKind};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct ResponseMeta {
    url: String,
    status: i64,
    mime_type: String,
    resource_type: ResourceKind,
}

/// Captures pattern-matched XHR/Fetch responses from a tab.
pub struct NetworkCapture<T: BrowserTab + 'static> {
    tab: Arc<T>,
    patterns: Arc<Vec<Regex>>,
    resource_types: Arc<Vec<ResourceKind>>,
    queue_capacity: usize,
    task: Option<JoinHandle<()>>,
    queue: Option<mpsc::Receiver<NetworkResponse>>,
}

impl<T: BrowserTab + 'static> NetworkCapture<T> {
    pub fn new(tab: Arc<T>, patterns: Vec<Regex>) -> Self {
        Self {
            tab,
            patterns: Arc::new(patterns),
            resource_types: Arc::new(vec![ResourceKind::Xhr, ResourceKind::Fetch]),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task: None,
            queue: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Subscribe to network events. Calling it again while running is a no-op.
    pub async fn start(&mut self) -> Result<(), BrowserError> {
        if self.task.is_some() {
            return Ok(());
        }

        let mut events = self.tab.network_events().await?;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let tab = Arc::clone(&self.tab);
        let patterns = Arc::clone(&self.patterns);
        let resource_types = Arc::clone(&self.resource_types);

        let task = tokio::spawn(async move {
            let mut pending: HashMap<String, ResponseMeta> = HashMap::new();

            while let Some(event) = events.next().await {
                match event {
                    NetworkEvent::ResponseReceived {
                        request_id,
                        url,
                        status,
                        mime_type,
                        resource_type,
                    } => {
                        if !resource_types.contains(&resource_type)
                            || !patterns.iter().any(|p| p.is_match(&url))
                        {
                            continue;
                        }
                        debug!("Matched response {} {}", request_id, url);
                        pending.insert(
                            request_id,
                            ResponseMeta {
                                url,
                                status,
                                mime_type,
                                resource_type,
                            },
                        );
                    }
                    NetworkEvent::LoadingFinished { request_id } => {
                        let Some(meta) = pending.remove(&request_id) else {
                            continue;
                        };
                        let Some(response) = fetch_body(tab.as_ref(), request_id, meta).await
                        else {
                            continue;
                        };
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.task = Some(task);
        self.queue = Some(rx);
        Ok(())
    }

    /// Stop listening. Responses already queued can still be drained.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Collect queued responses until `timeout` has elapsed or a wait for
    /// the next one would run past it.
    ///
    /// Responses already queued are taken without waiting, so a zero timeout
    /// returns whatever is buffered. Once the window is over at most one
    /// queue's worth of ready responses is taken.
    pub async fn drain(&mut self, timeout: Duration) -> Vec<NetworkResponse> {
        let mut collected = Vec::new();
        let capacity = self.queue_capacity;
        let Some(queue) = self.queue.as_mut() else {
            return collected;
        };

        let deadline = Instant::now() + timeout;
        let mut late = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match queue.try_recv() {
                Ok(response) => {
                    collected.push(response);
                    if remaining.is_zero() {
                        late += 1;
                        if late >= capacity {
                            break;
                        }
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) if remaining.is_zero() => break,
                Err(TryRecvError::Empty) => {}
            }
            match tokio::time::timeout(remaining, queue.recv()).await {
                Ok(Some(response)) => collected.push(response),
                Ok(None) | Err(_) => break,
            }
        }

        collected
    }
}

impl<T: BrowserTab + 'static> Drop for NetworkCapture<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fetch_body<T: BrowserTab>(
    tab: &T,
    request_id: String,
    meta: ResponseMeta,
) -> Option<NetworkResponse> {
    let body = match tab.response_body(&request_id).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read body for {} {}: {}", request_id, meta.url, e);
            return None;
        }
    };

    let text = if body.base64_encoded {
        match BASE64.decode(body.body.as_bytes()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("Undecodable body for {} {}: {}", request_id, meta.url, e);
                return None;
            }
        }
    } else {
        body.body
    };

    Some(NetworkResponse {
        url: meta.url,
        status: meta.status,
        mime_type: meta.mime_type,
        body: text,
        request_id,
        resource_type: meta.resource_type,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{xhr_events, FakeTab};
    use super::super::ResponseBody;
    use super::*;

    const API: &str = "https://x.com/i/api/graphql/abc/UserTweets?variables=1";

    fn capture(tab: &Arc<FakeTab>) -> NetworkCapture<FakeTab> {
        NetworkCapture::new(
            Arc::clone(tab),
            vec![Regex::new(r"https://x\.com/i/api/graphql/.+/UserTweets").unwrap()],
        )
    }

    fn emit_all(tab: &FakeTab, events: Vec<NetworkEvent>) {
        for event in events {
            tab.emit(event);
        }
    }

    #[tokio::test]
    async fn test_captures_matching_xhr_responses() {
        let tab = Arc::new(FakeTab::new());
        tab.body(
            "1",
            ResponseBody {
                body: "{\"data\":1}".to_string(),
                base64_encoded: false,
            },
        );
        tab.body(
            "2",
            ResponseBody {
                body: BASE64.encode("{\"data\":2}"),
                base64_encoded: true,
            },
        );

        let mut capture = capture(&tab);
        capture.start().await.unwrap();
        emit_all(&tab, xhr_events("1", API));
        emit_all(&tab, xhr_events("2", API));
        emit_all(&tab, xhr_events("3", "https://x.com/other"));

        let responses = capture.drain(Duration::from_millis(100)).await;
        let bodies: Vec<&str> = responses.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, vec!["{\"data\":1}", "{\"data\":2}"]);
        assert_eq!(responses[0].request_id, "1");
        assert_eq!(responses[0].status, 200);

        capture.stop();
    }

    #[tokio::test]
    async fn test_ignores_non_xhr_and_unmatched_finishes() {
        let tab = Arc::new(FakeTab::new());
        tab.body("doc", ResponseBody::default());

        let mut capture = capture(&tab);
        capture.start().await.unwrap();
        tab.emit(NetworkEvent::ResponseReceived {
            request_id: "doc".to_string(),
            url: API.to_string(),
            status: 200,
            mime_type: "text/html".to_string(),
            resource_type: ResourceKind::Document,
        });
        tab.emit(NetworkEvent::LoadingFinished {
            request_id: "doc".to_string(),
        });
        tab.emit(NetworkEvent::LoadingFinished {
            request_id: "never-seen".to_string(),
        });

        assert!(capture.drain(Duration::from_millis(60)).await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_is_bounded_without_traffic() {
        let tab = Arc::new(FakeTab::new());
        let mut capture = capture(&tab);
        capture.start().await.unwrap();

        let started = Instant::now();
        let responses = capture.drain(Duration::from_millis(80)).await;
        assert!(responses.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_drain_never_outlasts_its_timeout() {
        let tab = Arc::new(FakeTab::new());
        let mut capture = capture(&tab);
        capture.start().await.unwrap();

        let started = Instant::now();
        assert!(capture.drain(Duration::ZERO).await.is_empty());
        assert!(started.elapsed() < Duration::from_millis(50));

        let started = Instant::now();
        assert!(capture.drain(Duration::from_millis(10)).await.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_zero_timeout_takes_buffered_responses() {
        let tab = Arc::new(FakeTab::new());
        tab.body("1", ResponseBody::default());
        let mut capture = capture(&tab);
        capture.start().await.unwrap();
        emit_all(&tab, xhr_events("1", API));

        // Let the capture task queue the body before draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let responses = capture.drain(Duration::ZERO).await;
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let tab = Arc::new(FakeTab::new());
        let mut capture = capture(&tab);

        capture.stop();
        assert!(capture.drain(Duration::from_millis(10)).await.is_empty());

        capture.start().await.unwrap();
        capture.start().await.unwrap();
        assert!(capture.is_running());

        capture.stop();
        capture.stop();
        assert!(!capture.is_running());
    }
}
