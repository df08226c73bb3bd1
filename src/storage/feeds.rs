//! Per-domain cache of discovered feed links (`site_feeds`).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{Storage, StorageResult};
use crate::models::{format_timestamp, FeedLink, FeedType};

/// Feed-link cache backed by the storage collaborator.
#[derive(Clone)]
pub struct FeedLinkCache {
    storage: Arc<dyn Storage>,
}

impl FeedLinkCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Links for `domain` discovered at or after `cutoff`, newest first.
    pub async fn load_recent(&self, domain: &str, cutoff: DateTime<Utc>) -> StorageResult<Vec<FeedLink>> {
        let rows = self
            .storage
            .fetch_rows(
                "SELECT feed_url, feed_type FROM site_feeds \
                 WHERE domain = ? AND scraped_at >= ? \
                 ORDER BY scraped_at DESC, rowid ASC",
                vec![
                    Value::String(domain.to_string()),
                    Value::String(format_timestamp(&cutoff)),
                ],
            )
            .await?;
        Ok(rows_to_links(rows))
    }

    /// Every link ever recorded for `domain`, newest first.
    pub async fn load_all(&self, domain: &str) -> StorageResult<Vec<FeedLink>> {
        let rows = self
            .storage
            .fetch_rows(
                "SELECT feed_url, feed_type FROM site_feeds \
                 WHERE domain = ? ORDER BY scraped_at DESC, rowid ASC",
                vec![Value::String(domain.to_string())],
            )
            .await?;
        Ok(rows_to_links(rows))
    }

    /// Record freshly discovered links.
    pub async fn save(&self, domain: &str, links: &[FeedLink], scraped_at: DateTime<Utc>) -> StorageResult<usize> {
        let rows = links
            .iter()
            .map(|link| {
                let mut row = Map::new();
                row.insert("domain".into(), Value::String(domain.to_string()));
                row.insert("feed_url".into(), Value::String(link.url.clone()));
                row.insert(
                    "feed_type".into(),
                    Value::String(link.feed_type.as_str().to_string()),
                );
                row.insert(
                    "scraped_at".into(),
                    Value::String(format_timestamp(&scraped_at)),
                );
                row
            })
            .collect();
        self.storage.insert_rows("site_feeds", rows).await
    }
}

/// Rows to links, dropping duplicate URLs and unknown types.
fn rows_to_links(rows: Vec<super::Row>) -> Vec<FeedLink> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter_map(|row| {
            let url = row.get("feed_url")?.as_str()?.to_string();
            let feed_type = FeedType::parse(row.get("feed_type")?.as_str()?)?;
            seen.insert(url.clone())
                .then(|| FeedLink::new(url, feed_type, None))
        })
        .collect()
}
