//! Landing-page extraction: metadata, article body, media references and
//! publish dates.
//!
//! html5ever (via `scraper`) builds the DOM, so unclosed tags, stray end tags
//! and void elements are normalized before any of these scans run.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use super::dates::{parse_feed_datetime, parse_metadata_datetime};
use crate::models::AssetType;

const CONTENT_CLASS_KEYS: [&str; 8] = [
    "article-body",
    "article-content",
    "content-body",
    "entry-content",
    "post-body",
    "post-content",
    "single-post",
    "single-video",
];

const CONTENT_ID_KEYS: [&str; 6] = [
    "article-body",
    "article-content",
    "content-body",
    "entry-content",
    "post-body",
    "post-content",
];

const MEDIA_SRC_ATTRS: [&str; 5] = ["src", "data-src", "data-lazy-src", "data-original", "data-lazy"];

const PAGE_DATE_KEYS: [&str; 15] = [
    "article:published_time",
    "article:published",
    "og:published_time",
    "published_time",
    "pubdate",
    "publishdate",
    "publish_date",
    "date",
    "datepublished",
    "date_published",
    "datecreated",
    "date_created",
    "dc.date",
    "dc.date.issued",
    "dc.date.created",
];

const PAGE_ITEMPROP_KEYS: [&str; 3] = ["datepublished", "datecreated", "date"];

const YOUTUBE_HOSTS: [&str; 6] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtu.be",
    "www.youtu.be",
    "youtube-nocookie.com",
];

/// Metadata read from a page's `<head>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: String,
    pub author: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Kind of a content container, in descending preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ContentKind {
    TemplateContent,
    TemplateVideo,
    EntryContent,
    ArticleMain,
    Article,
    ContentBlock,
}

/// A media reference found on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAsset {
    pub url: String,
    pub asset_type: AssetType,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn classes(element: &ElementRef<'_>) -> Vec<String> {
    element
        .value()
        .attr("class")
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect()
}

fn has_ancestor(element: &ElementRef<'_>, names: &[&str]) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| names.contains(&a.value().name()))
}

/// Collect `<meta>` values keyed by lowercased `property`/`name`; first wins.
fn meta_map(document: &Html) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    let Some(sel) = selector("meta") else {
        return meta;
    };
    for element in document.select(&sel) {
        let attrs = element.value();
        let key = attrs
            .attr("property")
            .or_else(|| attrs.attr("name"))
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let content = attrs
            .attr("content")
            .or_else(|| attrs.attr("value"))
            .unwrap_or_default()
            .trim();
        if !key.is_empty() && !content.is_empty() {
            meta.entry(key).or_insert_with(|| content.to_string());
        }
    }
    meta
}

/// Read title, author and publish time from a page.
pub fn extract_page_metadata(html: &str) -> PageMetadata {
    if html.trim().is_empty() {
        return PageMetadata::default();
    }
    let document = Html::parse_document(html);
    let meta = meta_map(&document);
    let get = |key: &str| meta.get(key).map(String::as_str);

    let title = get("og:title")
        .or_else(|| get("twitter:title"))
        .map(str::to_string)
        .or_else(|| {
            let sel = selector("title")?;
            document
                .select(&sel)
                .next()
                .map(|t| t.text().collect::<String>().trim().to_string())
        })
        .unwrap_or_default();

    let published_at = get("article:published_time")
        .or_else(|| get("og:published_time"))
        .or_else(|| get("published_time"))
        .and_then(parse_metadata_datetime);

    PageMetadata {
        title,
        author: select_author(&meta, &document),
        published_at,
    }
}

fn select_author(meta: &HashMap<String, String>, document: &Html) -> String {
    if let Some(author) = meta.get("author").or_else(|| meta.get("article:author")) {
        return author.clone();
    }

    let label = meta
        .get("twitter:label1")
        .map(|l| l.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if matches!(label.as_str(), "written by" | "author" | "by") {
        if let Some(data) = meta.get("twitter:data1").filter(|d| !d.trim().is_empty()) {
            return data.trim().to_string();
        }
    }

    if let Some(creator) = meta
        .get("twitter:creator")
        .and_then(|c| c.trim().strip_prefix('@'))
    {
        return creator.to_string();
    }

    jsonld_author(document).unwrap_or_default()
}

fn jsonld_author(document: &Html) -> Option<String> {
    let sel = selector("script[type]")?;
    document
        .select(&sel)
        .filter(|script| {
            script
                .value()
                .attr("type")
                .is_some_and(|t| t.trim().eq_ignore_ascii_case("application/ld+json"))
        })
        .filter_map(|script| serde_json::from_str::<Value>(&script.text().collect::<String>()).ok())
        .find_map(|block| {
            // Pre-order walk so the outermost declaration wins.
            let mut stack = vec![&block];
            while let Some(node) = stack.pop() {
                match node {
                    Value::Object(map) => {
                        if let Some(author) = author_from_node(map) {
                            return Some(author);
                        }
                        stack.extend(map.values().rev());
                    }
                    Value::Array(items) => stack.extend(items.iter().rev()),
                    _ => {}
                }
            }
            None
        })
}

fn author_from_node(node: &serde_json::Map<String, Value>) -> Option<String> {
    let truthy = |v: &&Value| match v {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    };
    let author = node
        .get("author")
        .filter(truthy)
        .or_else(|| node.get("creator").filter(truthy))?;

    let named = |value: &Value| match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    match author {
        Value::Array(items) => items.iter().find_map(named),
        other => named(other),
    }
    .filter(|a| !a.is_empty())
}

fn content_kind(element: &ElementRef<'_>) -> Option<ContentKind> {
    let el = element.value();
    match el.name() {
        "template" => {
            let slot = |name: &str| {
                el.attr(&format!("v-slot:{name}")).is_some() || el.attr("slot") == Some(name)
            };
            if has_ancestor(element, &["single-post", "single-video"]) && slot("content") {
                Some(ContentKind::TemplateContent)
            } else if has_ancestor(element, &["single-video"]) && slot("video") {
                Some(ContentKind::TemplateVideo)
            } else {
                None
            }
        }
        "article" if has_ancestor(element, &["main"]) => Some(ContentKind::ArticleMain),
        "article" => Some(ContentKind::Article),
        "div" | "section" | "main" => {
            let classes = classes(element);
            if classes.iter().any(|c| c == "entry-content") {
                return Some(ContentKind::EntryContent);
            }
            if classes.iter().any(|c| CONTENT_CLASS_KEYS.contains(&c.as_str())) {
                return Some(ContentKind::ContentBlock);
            }
            let id = el.id().unwrap_or_default().to_ascii_lowercase();
            CONTENT_ID_KEYS
                .iter()
                .any(|key| id.contains(key))
                .then_some(ContentKind::ContentBlock)
        }
        _ => None,
    }
}

/// Outermost content containers in document order. A container nested in
/// another candidate is never reported on its own.
fn content_candidates(document: &Html) -> Vec<(ContentKind, ElementRef<'_>)> {
    let mut found: Vec<(ContentKind, ElementRef<'_>)> = Vec::new();
    for element in document.root_element().descendants().filter_map(ElementRef::wrap) {
        let inside_capture = found
            .last()
            .is_some_and(|(_, outer)| element.ancestors().any(|a| a.id() == outer.id()));
        if inside_capture {
            continue;
        }
        if let Some(kind) = content_kind(&element) {
            found.push((kind, element));
        }
    }
    found
}

/// The inner HTML of the best content container, or an empty string.
pub fn extract_article_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let document = Html::parse_document(html);

    let mut best: Option<(ContentKind, String)> = None;
    for (kind, element) in content_candidates(&document) {
        let inner = element.inner_html().trim().to_string();
        if inner.is_empty() {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_kind, best_html)) => {
                kind < *best_kind || (kind == *best_kind && inner.len() > best_html.len())
            }
        };
        if better {
            best = Some((kind, inner));
        }
    }
    best.map(|(_, html)| html).unwrap_or_default()
}

/// Whether `url` points at a YouTube host.
pub fn is_youtube_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };
    YOUTUBE_HOSTS.contains(&host.as_str())
        || host.ends_with(".youtube.com")
        || host.ends_with(".youtube-nocookie.com")
}

/// Serialized YouTube iframes found on the page, one per line.
pub fn extract_youtube_iframes(html: &str) -> String {
    let document = Html::parse_document(html);
    let Some(sel) = selector("iframe[src]") else {
        return String::new();
    };
    document
        .select(&sel)
        .filter(|iframe| iframe.value().attr("src").is_some_and(is_youtube_url))
        .map(|iframe| iframe.html())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve and normalize a media URL. Inline and script URLs are rejected.
pub fn normalize_asset_url(base_url: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lowered = raw.to_ascii_lowercase();
    if lowered.starts_with("data:") || lowered.starts_with("javascript:") {
        return None;
    }
    let mut resolved = match Url::parse(base_url) {
        Ok(base) => base.join(raw).ok()?,
        Err(_) => Url::parse(raw).ok()?,
    };
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Accumulates page assets, keeping the highest-priority type per URL and
/// first-seen order.
#[derive(Debug, Default)]
pub struct AssetCollector {
    order: Vec<String>,
    types: HashMap<String, AssetType>,
}

impl AssetCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `url` under `asset_type`; a higher-priority type upgrades an
    /// existing entry, a lower one never downgrades it.
    pub fn add(&mut self, url: String, asset_type: AssetType) {
        match self.types.get_mut(&url) {
            Some(existing) => {
                if asset_type.priority() > existing.priority() {
                    *existing = asset_type;
                }
            }
            None => {
                self.types.insert(url.clone(), asset_type);
                self.order.push(url);
            }
        }
    }

    pub fn into_assets(mut self) -> Vec<PageAsset> {
        self.order
            .into_iter()
            .filter_map(|url| {
                let asset_type = self.types.remove(&url)?;
                Some(PageAsset { url, asset_type })
            })
            .collect()
    }
}

fn is_media_scope(element: &ElementRef<'_>) -> bool {
    let el = element.value();
    if matches!(el.name(), "article" | "single-post" | "single-video") {
        return true;
    }
    if classes(element)
        .iter()
        .any(|c| CONTENT_CLASS_KEYS.contains(&c.as_str()))
    {
        return true;
    }
    let id = el.id().unwrap_or_default().to_ascii_lowercase();
    !id.is_empty() && CONTENT_ID_KEYS.iter().any(|key| id.contains(key))
}

fn media_type(element: &ElementRef<'_>, url: &str) -> Option<AssetType> {
    match element.value().name() {
        "img" => Some(AssetType::Image),
        "video" => Some(AssetType::Video),
        "audio" => Some(AssetType::Audio),
        "iframe" if is_youtube_url(url) => Some(AssetType::Youtube),
        "iframe" => Some(AssetType::Iframe),
        "source" => {
            let parent = element.parent().and_then(ElementRef::wrap);
            Some(match parent.map(|p| p.value().name()) {
                Some("video") => AssetType::Video,
                Some("audio") => AssetType::Audio,
                Some("picture") => AssetType::Image,
                _ => AssetType::Media,
            })
        }
        _ => None,
    }
}

/// Scan a page for media elements. The scan is limited to article/content
/// containers when the page has any, otherwise it covers the whole document.
pub fn extract_page_assets(html: &str, base_url: &str) -> Vec<PageAsset> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    let Some(media) = selector("img, video, audio, source, iframe") else {
        return Vec::new();
    };

    let mut scopes: Vec<ElementRef<'_>> = Vec::new();
    for element in document.root_element().descendants().filter_map(ElementRef::wrap) {
        let nested = scopes
            .iter()
            .any(|scope| element.ancestors().any(|a| a.id() == scope.id()));
        if !nested && is_media_scope(&element) {
            scopes.push(element);
        }
    }
    if scopes.is_empty() {
        scopes.push(document.root_element());
    }

    let mut collector = AssetCollector::new();
    let mut seen_elements = HashSet::new();
    for scope in scopes {
        for element in scope.select(&media) {
            if !seen_elements.insert(element.id()) {
                continue;
            }
            let attrs = element.value();
            for attr in MEDIA_SRC_ATTRS {
                let Some(url) = attrs.attr(attr).and_then(|raw| normalize_asset_url(base_url, raw)) else {
                    continue;
                };
                if let Some(asset_type) = media_type(&element, &url) {
                    collector.add(url, asset_type);
                }
            }
        }
    }
    collector.into_assets()
}

/// Best-effort publish date of a page, for feed entries that carry none.
pub fn extract_page_published_at(html: &str) -> Option<DateTime<Utc>> {
    if html.trim().is_empty() {
        return None;
    }
    let document = Html::parse_document(html);
    let sel = selector("meta, time, [itemprop]")?;

    let mut candidates: Vec<String> = Vec::new();
    for element in document.select(&sel) {
        let attrs = element.value();
        let value = |key: &str| attrs.attr(key).filter(|v| !v.is_empty());
        match attrs.name() {
            "meta" => {
                let key = value("property")
                    .or_else(|| value("name"))
                    .or_else(|| value("itemprop"))
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if PAGE_DATE_KEYS.contains(&key.as_str()) {
                    if let Some(content) = value("content").or_else(|| value("value")) {
                        candidates.push(content.to_string());
                    }
                }
            }
            "time" => {
                if let Some(datetime) = value("datetime").or_else(|| value("content")) {
                    candidates.push(datetime.to_string());
                }
            }
            _ => {
                let itemprop = value("itemprop").unwrap_or_default().to_ascii_lowercase();
                if PAGE_ITEMPROP_KEYS.contains(&itemprop.as_str()) {
                    if let Some(content) = value("content").or_else(|| value("datetime")) {
                        candidates.push(content.to_string());
                    }
                }
            }
        }
    }

    candidates.iter().find_map(|candidate| {
        let trimmed = candidate.trim();
        match trimmed.strip_suffix('Z') {
            Some(rest) => parse_feed_datetime(&format!("{rest}+00:00")),
            None => parse_feed_datetime(trimmed),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML_SINGLE_POST: &str = r#"
<html>
  <head>
    <meta property="og:title" content="Sample Post" />
    <meta name="author" content="Sample Author" />
    <meta property="article:published_time" content="2026-02-01T10:52:05+00:00" />
    <meta name="twitter:label1" content="Written by" />
    <meta name="twitter:data1" content="Ignored Author" />
  </head>
  <body class="single single-post">
    <single-post>
      <template v-slot:content>
        <p>First line in body.</p>
        <p>Second line.</p>
      </template>
    </single-post>
  </body>
</html>"#;

    const HTML_ARTICLE: &str = r#"
<html>
  <head>
    <title> Fallback Title </title>
    <script type="application/ld+json">
      {"@context":"https://schema.org","@type":"Article","author":
      {"@type":"Person","name":"Writer Name"}}
    </script>
  </head>
  <body>
    <main>
      <article>
        <div class="entry-content">
          <p>Intro paragraph.</p>
          <img src="https://cdn.example.test/image.jpg" />
          <iframe src="https://www.youtube.com/embed/abc123"></iframe>
        </div>
      </article>
    </main>
  </body>
</html>"#;

    const HTML_WITH_ASSETS: &str = r#"
<html>
  <body>
    <header><img src="/logo.png"></header>
    <article>
      <img src="/img.png" />
      <video src="video.mp4"><source src="alt.mp4" /></video>
      <audio><source src="audio.mp3" /></audio>
      <iframe src="https://www.youtube.com/embed/abc123"></iframe>
      <iframe src="https://player.vimeo.com/video/999"></iframe>
      <img src="data:image/png;base64,AAAA">
      <img data-src="/lazy.jpg#frag">
    </article>
  </body>
</html>"#;

    #[test]
    fn test_article_html_prefers_template_slot() {
        let html = extract_article_html(HTML_SINGLE_POST);
        assert!(html.contains("First line in body."));
        assert!(!html.contains("<single-post"));
        assert!(!html.contains("<template"));
    }

    #[test]
    fn test_article_html_captures_outermost_article() {
        let html = extract_article_html(HTML_ARTICLE);
        assert!(html.contains("https://cdn.example.test/image.jpg"));
        assert!(html.contains("youtube.com/embed/abc123"));
        assert!(html.contains("entry-content"));
    }

    #[test]
    fn test_article_html_priority_and_length() {
        let html = r#"<body>
<section class="post-body"><p>block</p></section>
<article><p>short</p></article>
<article><p>a much longer article body</p></article>
</body>"#;
        assert_eq!(extract_article_html(html), "<p>a much longer article body</p>");
    }

    #[test]
    fn test_article_html_tolerates_broken_markup() {
        let html = "<body><div class='entry-content'><p>open<br><b>bold</div></span></body>";
        let extracted = extract_article_html(html);
        assert!(extracted.contains("open"));
        assert!(extracted.contains("bold"));
        assert_eq!(extract_article_html(""), "");
        assert_eq!(extract_article_html("<p>nothing here</p>"), "");
    }

    #[test]
    fn test_metadata_author_from_meta() {
        let meta = extract_page_metadata(HTML_SINGLE_POST);
        assert_eq!(meta.title, "Sample Post");
        assert_eq!(meta.author, "Sample Author");
        assert_eq!(
            meta.published_at.unwrap().to_rfc3339(),
            "2026-02-01T10:52:05+00:00"
        );
    }

    #[test]
    fn test_metadata_author_from_jsonld() {
        let meta = extract_page_metadata(HTML_ARTICLE);
        assert_eq!(meta.author, "Writer Name");
        assert_eq!(meta.title, "Fallback Title");
        assert!(meta.published_at.is_none());
    }

    #[test]
    fn test_metadata_author_from_twitter_label_and_creator() {
        let html = r#"<head><meta name="twitter:label1" content="Author" />
<meta name="twitter:data1" content="Twitter Author" /></head>"#;
        assert_eq!(extract_page_metadata(html).author, "Twitter Author");

        let html = r#"<head><meta name="twitter:creator" content="@handle" /></head>"#;
        assert_eq!(extract_page_metadata(html).author, "handle");
    }

    #[test]
    fn test_jsonld_author_list() {
        let html = r#"<head><script type="application/ld+json">
[{"@type":"WebPage"},{"@graph":[{"@type":"NewsArticle","creator":["Listed Person"]}]}]
</script></head>"#;
        assert_eq!(extract_page_metadata(html).author, "Listed Person");
    }

    #[test]
    fn test_page_assets_types() {
        let assets = extract_page_assets(HTML_WITH_ASSETS, "https://news.example.test/post");
        let by_url: HashMap<&str, AssetType> = assets
            .iter()
            .map(|a| (a.url.as_str(), a.asset_type))
            .collect();

        assert_eq!(by_url["https://news.example.test/img.png"], AssetType::Image);
        assert_eq!(by_url["https://news.example.test/video.mp4"], AssetType::Video);
        assert_eq!(by_url["https://news.example.test/alt.mp4"], AssetType::Video);
        assert_eq!(by_url["https://news.example.test/audio.mp3"], AssetType::Audio);
        assert_eq!(by_url["https://www.youtube.com/embed/abc123"], AssetType::Youtube);
        assert_eq!(by_url["https://player.vimeo.com/video/999"], AssetType::Iframe);
        assert_eq!(by_url["https://news.example.test/lazy.jpg"], AssetType::Image);
        assert!(!by_url.contains_key("https://news.example.test/logo.png"));
        assert!(assets.iter().all(|a| !a.url.starts_with("data:")));
    }

    #[test]
    fn test_page_assets_without_article_scan_whole_page() {
        let html = r#"<body><p><img src="/a.jpg"></p></body>"#;
        let assets = extract_page_assets(html, "https://e.test/post");
        assert_eq!(
            assets,
            vec![PageAsset {
                url: "https://e.test/a.jpg".into(),
                asset_type: AssetType::Image
            }]
        );
    }

    #[test]
    fn test_collector_upgrades_but_never_downgrades() {
        let url = "https://www.youtube.com/embed/x".to_string();

        let mut collector = AssetCollector::new();
        collector.add(url.clone(), AssetType::Iframe);
        collector.add(url.clone(), AssetType::Youtube);
        assert_eq!(collector.into_assets()[0].asset_type, AssetType::Youtube);

        let mut collector = AssetCollector::new();
        collector.add(url.clone(), AssetType::Youtube);
        collector.add(url, AssetType::Iframe);
        let assets = collector.into_assets();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].asset_type, AssetType::Youtube);
    }

    #[test]
    fn test_youtube_hosts() {
        assert!(is_youtube_url("https://youtu.be/abc"));
        assert!(is_youtube_url("https://www.youtube-nocookie.com/embed/abc"));
        assert!(is_youtube_url("https://music.youtube.com/watch?v=1"));
        assert!(!is_youtube_url("https://notyoutube.com/embed/abc"));
        assert!(!is_youtube_url("not a url"));
    }

    #[test]
    fn test_youtube_iframes() {
        let iframes = extract_youtube_iframes(HTML_ARTICLE);
        assert!(iframes.contains("youtube.com/embed/abc123"));
        assert!(iframes.starts_with("<iframe"));
    }

    #[test]
    fn test_page_published_at_candidates() {
        let html = r#"<head><meta name="dc.date" content="bogus"><meta itemprop="datePublished" content="2026-02-01T05:00:00Z"></head>"#;
        assert_eq!(
            extract_page_published_at(html).unwrap().to_rfc3339(),
            "2026-02-01T05:00:00+00:00"
        );

        let html = r#"<body><time datetime="2026-02-03">Feb 3</time></body>"#;
        assert_eq!(
            extract_page_published_at(html).unwrap().to_rfc3339(),
            "2026-02-03T00:00:00+00:00"
        );

        assert!(extract_page_published_at("<p>no dates</p>").is_none());
    }
}
