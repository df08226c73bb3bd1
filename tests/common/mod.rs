//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use dank::models::{AssetDiscovery, AssetType};
use dank::scrapers::{BodyStream, FetchError, Fetcher};

/// In-memory site: URL to body, with a log of requested URLs.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    fn lookup(&self, url: &str) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

struct OneChunk(Option<Bytes>);

#[async_trait]
impl BodyStream for OneChunk {
    fn content_length(&self) -> Option<u64> {
        self.0.as_ref().map(|b| b.len() as u64)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        Ok(self.0.take())
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_text(&self, url: &str, _accept: &[String]) -> Result<String, FetchError> {
        self.lookup(url)
    }

    async fn open(&self, url: &str) -> Result<Box<dyn BodyStream>, FetchError> {
        let body = self.lookup(url)?;
        Ok(Box::new(OneChunk(Some(Bytes::from(body)))))
    }
}

pub fn discovery(domain: &str, post_id: &str, url: &str, asset_type: AssetType) -> AssetDiscovery {
    AssetDiscovery {
        source: "rss".to_string(),
        domain: domain.to_string(),
        post_id: post_id.to_string(),
        url: url.to_string(),
        asset_type,
    }
}
