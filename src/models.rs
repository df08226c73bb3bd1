//! Record types shared by the crawlers, the ingestion pipeline and storage.
//!
//! Records are immutable once built. Derived copies are produced with the
//! `with_*` helpers, which consume `self` and return a new value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::Row;

/// Serialize a timestamp the way every stored row carries it.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A post as scraped, before any downstream processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    pub domain: String,
    pub post_id: String,
    pub url: String,
    pub post_created_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
    pub request_url: String,
    /// Opaque source-specific blob (tweet JSON, or feed XML bundled with page HTML).
    pub payload: String,
}

impl RawPost {
    /// Derive a copy with a different payload.
    pub fn with_payload(self, payload: String) -> Self {
        Self { payload, ..self }
    }

    /// Storage row for the `raw_posts` table.
    pub fn to_row(&self) -> Row {
        let mut row = Map::new();
        row.insert("domain".into(), Value::String(self.domain.clone()));
        row.insert("post_id".into(), Value::String(self.post_id.clone()));
        row.insert("url".into(), Value::String(self.url.clone()));
        row.insert(
            "post_created_at".into(),
            self.post_created_at
                .as_ref()
                .map(|t| Value::String(format_timestamp(t)))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "scraped_at".into(),
            Value::String(format_timestamp(&self.scraped_at)),
        );
        row.insert("source".into(), Value::String(self.source.clone()));
        row.insert(
            "request_url".into(),
            Value::String(self.request_url.clone()),
        );
        row.insert("payload".into(), Value::String(self.payload.clone()));
        row
    }
}

/// Kind of media or reference an asset URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
    Audio,
    Iframe,
    Youtube,
    Link,
    Media,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Image => "image",
            AssetType::Video => "video",
            AssetType::Audio => "audio",
            AssetType::Iframe => "iframe",
            AssetType::Youtube => "youtube",
            AssetType::Link => "link",
            AssetType::Media => "media",
        }
    }

    /// Parse a stored or platform-provided type name.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" => AssetType::Image,
            "video" => AssetType::Video,
            "audio" => AssetType::Audio,
            "iframe" => AssetType::Iframe,
            "youtube" => AssetType::Youtube,
            "link" => AssetType::Link,
            _ => AssetType::Media,
        }
    }

    /// Rank used when one URL is discovered under several types.
    pub fn priority(&self) -> u8 {
        match self {
            AssetType::Youtube => 4,
            AssetType::Video | AssetType::Audio => 3,
            AssetType::Image => 2,
            AssetType::Iframe => 1,
            AssetType::Link | AssetType::Media => 0,
        }
    }

    /// Embeds and outbound links are recorded but never fetched.
    pub fn is_downloadable(&self) -> bool {
        !matches!(
            self,
            AssetType::Iframe | AssetType::Link | AssetType::Youtube
        )
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An asset reference found during extraction, not yet fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDiscovery {
    pub source: String,
    pub domain: String,
    pub post_id: String,
    pub url: String,
    pub asset_type: AssetType,
}

/// A resolved asset. An empty `local_path` means it was not downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAsset {
    pub domain: String,
    pub post_id: String,
    pub url: String,
    pub asset_type: AssetType,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
    pub local_path: String,
}

impl RawAsset {
    /// Build a not-yet-downloaded record from a discovery.
    pub fn from_discovery(discovery: &AssetDiscovery, scraped_at: DateTime<Utc>) -> Self {
        Self {
            domain: discovery.domain.clone(),
            post_id: discovery.post_id.clone(),
            url: discovery.url.clone(),
            asset_type: discovery.asset_type,
            scraped_at,
            source: discovery.source.clone(),
            local_path: String::new(),
        }
    }

    /// Derive a copy pointing at a file on disk.
    pub fn with_local_path(self, local_path: String) -> Self {
        Self { local_path, ..self }
    }

    pub fn is_downloaded(&self) -> bool {
        !self.local_path.is_empty()
    }

    /// Storage row for the `raw_assets` table.
    pub fn to_row(&self) -> Row {
        let mut row = Map::new();
        row.insert("domain".into(), Value::String(self.domain.clone()));
        row.insert("post_id".into(), Value::String(self.post_id.clone()));
        row.insert("url".into(), Value::String(self.url.clone()));
        row.insert(
            "asset_type".into(),
            Value::String(self.asset_type.as_str().to_string()),
        );
        row.insert(
            "scraped_at".into(),
            Value::String(format_timestamp(&self.scraped_at)),
        );
        row.insert("source".into(), Value::String(self.source.clone()));
        row.insert(
            "local_path".into(),
            Value::String(self.local_path.clone()),
        );
        row
    }
}

/// Syndication format of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    // Declaration order is preference order.
    Atom,
    Rss2,
    Rss1,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Atom => "atom",
            FeedType::Rss2 => "rss2",
            FeedType::Rss1 => "rss1",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "atom" => Some(FeedType::Atom),
            "rss2" => Some(FeedType::Rss2),
            "rss1" => Some(FeedType::Rss1),
            _ => None,
        }
    }

    /// Infer the feed type from a `<link type=...>` hint.
    pub fn from_mime(mime: Option<&str>) -> Self {
        let mime = mime.unwrap_or_default().to_ascii_lowercase();
        if mime.contains("atom") {
            FeedType::Atom
        } else if mime.contains("rdf") {
            FeedType::Rss1
        } else {
            FeedType::Rss2
        }
    }
}

impl std::fmt::Display for FeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feed advertised by a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLink {
    pub url: String,
    pub feed_type: FeedType,
    pub mime_type: Option<String>,
}

impl FeedLink {
    pub fn new(url: impl Into<String>, feed_type: FeedType, mime_type: Option<String>) -> Self {
        Self {
            url: url.into(),
            feed_type,
            mime_type,
        }
    }
}

/// Unit of transfer between a crawler and the ingestion pipeline.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub posts: Vec<RawPost>,
    pub assets: Vec<AssetDiscovery>,
}

impl Batch {
    pub fn new(posts: Vec<RawPost>, assets: Vec<AssetDiscovery>) -> Self {
        Self { posts, assets }
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty() && self.assets.is_empty()
    }
}

/// Resource class reported by the browser for a network request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Xhr,
    Fetch,
    Document,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Xhr => "XHR",
            ResourceKind::Fetch => "Fetch",
            ResourceKind::Document => "Document",
            ResourceKind::Other => "Other",
        }
    }
}

/// A completed, pattern-matched response captured from the browser.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub url: String,
    pub status: i64,
    pub mime_type: String,
    pub body: String,
    pub request_id: String,
    pub resource_type: ResourceKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_post() -> RawPost {
        RawPost {
            domain: "example.test".to_string(),
            post_id: "abc".to_string(),
            url: "https://example.test/post".to_string(),
            post_created_at: None,
            scraped_at: Utc.with_ymd_and_hms(2026, 2, 1, 1, 0, 0).unwrap(),
            source: "rss".to_string(),
            request_url: "https://example.test/feed".to_string(),
            payload: "<item/>".to_string(),
        }
    }

    #[test]
    fn test_with_payload_leaves_original_untouched() {
        let post = sample_post();
        let derived = post.clone().with_payload("{}".to_string());
        assert_eq!(post.payload, "<item/>");
        assert_eq!(derived.payload, "{}");
        assert_eq!(derived.post_id, post.post_id);
    }

    #[test]
    fn test_post_row_timestamps_are_millisecond_utc() {
        let row = sample_post().to_row();
        assert_eq!(row["scraped_at"], "2026-02-01T01:00:00.000Z");
        assert_eq!(row["post_created_at"], Value::Null);
    }

    #[test]
    fn test_asset_priority_order() {
        assert!(AssetType::Youtube.priority() > AssetType::Video.priority());
        assert_eq!(AssetType::Video.priority(), AssetType::Audio.priority());
        assert!(AssetType::Video.priority() > AssetType::Image.priority());
        assert!(AssetType::Image.priority() > AssetType::Iframe.priority());
        assert!(AssetType::Iframe.priority() > AssetType::Media.priority());
    }

    #[test]
    fn test_feed_type_from_mime() {
        assert_eq!(
            FeedType::from_mime(Some("application/atom+xml")),
            FeedType::Atom
        );
        assert_eq!(
            FeedType::from_mime(Some("application/rdf+xml")),
            FeedType::Rss1
        );
        assert_eq!(FeedType::from_mime(Some("text/xml")), FeedType::Rss2);
        assert_eq!(FeedType::from_mime(None), FeedType::Rss2);
    }

    #[test]
    fn test_skip_types_are_not_downloadable() {
        assert!(!AssetType::Iframe.is_downloadable());
        assert!(!AssetType::Link.is_downloadable());
        assert!(!AssetType::Youtube.is_downloadable());
        assert!(AssetType::Image.is_downloadable());
        assert!(AssetType::Media.is_downloadable());
    }
}
