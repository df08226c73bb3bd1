//! Feed discovery and entry parsing.
//!
//! Only the parts of RSS 2.0, RSS 1.0 (RDF) and Atom needed to identify a
//! post are read: its link, its date, and the raw entry markup.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::dates::parse_feed_datetime;
use crate::models::{FeedLink, FeedType};

/// MIME fragments that mark a `<link>` as a feed.
pub const FEED_MIME_HINTS: [&str; 4] = ["rss", "atom", "xml", "rdf"];

/// A single entry parsed from a feed document.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// Entry link resolved against the site root (the root itself when absent).
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    /// The entry's markup exactly as it appears in the feed.
    pub payload: String,
}

/// Resolve `href` against `base`, falling back to the raw value.
pub fn resolve_url(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Collect feed links advertised in the document head.
pub fn discover_feed_links(html: &str, root_url: &str) -> Vec<FeedLink> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("head link") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let attrs = element.value();
        let Some(href) = attrs.attr("href").filter(|h| !h.trim().is_empty()) else {
            continue;
        };
        let rel = attrs.attr("rel").unwrap_or_default().to_ascii_lowercase();
        if !rel.contains("alternate") && !rel.contains("feed") {
            continue;
        }
        let type_hint = attrs
            .attr("type")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !type_hint.is_empty() && !FEED_MIME_HINTS.iter().any(|hint| type_hint.contains(hint)) {
            continue;
        }

        let absolute = resolve_url(root_url, href.trim());
        if seen.insert(absolute.clone()) {
            let mime = (!type_hint.is_empty()).then_some(type_hint);
            links.push(FeedLink::new(absolute, FeedType::from_mime(mime.as_deref()), mime));
        }
    }

    links
}

/// Order feed links by preference (atom, rss2, rss1), keeping document order
/// among equals.
pub fn sort_feed_links(links: &mut [FeedLink]) {
    links.sort_by_key(|link| link.feed_type);
}

/// The single most preferred feed link.
pub fn select_feed_link(links: &[FeedLink]) -> Option<&FeedLink> {
    links.iter().min_by_key(|link| link.feed_type)
}

/// Accept header values for fetching a feed.
pub fn feed_accept(link: &FeedLink) -> Vec<String> {
    if let Some(mime) = link.mime_type.as_deref().filter(|m| !m.is_empty()) {
        return vec![mime.to_string()];
    }
    let primary = match link.feed_type {
        FeedType::Atom => "application/atom+xml",
        FeedType::Rss1 => "application/rdf+xml",
        FeedType::Rss2 => "application/rss+xml",
    };
    vec![
        primary.to_string(),
        "application/xml".to_string(),
        "text/xml".to_string(),
    ]
}

/// Minimal element tree with byte spans into the source document.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
    start: usize,
    end: usize,
}

impl XmlNode {
    fn from_start(e: &BytesStart<'_>, start: usize) -> Self {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let attrs = e
            .attributes()
            .flatten()
            .filter_map(|attr| {
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_ascii_lowercase();
                let value = attr.unescape_value().ok()?.into_owned();
                Some((key, value))
            })
            .collect();
        Self {
            name,
            attrs,
            start,
            ..Default::default()
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.is(name))
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.is(name))
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }
}

/// Parse `xml` into a tree. Any well-formedness error yields `None`.
fn parse_tree(xml: &str) -> Option<XmlNode> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlNode> = Vec::new();

    loop {
        let before = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                debug!("Failed to parse feed XML: {}", e);
                return None;
            }
        };
        let after = reader.buffer_position() as usize;

        match event {
            Event::Start(e) => stack.push(XmlNode::from_start(&e, before)),
            Event::Empty(e) => {
                let mut node = XmlNode::from_start(&e, before);
                node.end = after;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Some(node),
                }
            }
            Event::End(_) => {
                let mut node = stack.pop()?;
                node.end = after;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Some(node),
                }
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    match t.unescape() {
                        Ok(text) => current.text.push_str(&text),
                        // Undeclared HTML entities: keep the raw text.
                        Err(_) => current.text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Event::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Parse the entries of an Atom, RSS 2.0 or RSS 1.0 document.
///
/// Malformed XML and unknown root elements yield no entries.
pub fn parse_feed_entries(xml: &str, root_url: &str) -> Vec<FeedEntry> {
    if xml.trim().is_empty() {
        return Vec::new();
    }
    let Some(root) = parse_tree(xml) else {
        return Vec::new();
    };

    let entry = |node: &XmlNode, link: Option<&str>, created_at: Option<DateTime<Utc>>| FeedEntry {
        url: match link {
            Some(link) => resolve_url(root_url, link),
            None => root_url.to_string(),
        },
        created_at,
        payload: xml.get(node.start..node.end).unwrap_or_default().to_string(),
    };

    if root.is("feed") {
        root.children_named("entry")
            .map(|node| {
                let date = node
                    .child_text("published")
                    .or_else(|| node.child_text("updated"))
                    .and_then(parse_feed_datetime);
                entry(node, atom_entry_link(node), date)
            })
            .collect()
    } else if root.is("rss") {
        root.child("channel")
            .map(|channel| {
                channel
                    .children_named("item")
                    .map(|node| {
                        let date = node.child_text("pubDate").and_then(parse_feed_datetime);
                        entry(node, node.child_text("link"), date)
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else if root.is("rdf") {
        root.children_named("item")
            .map(|node| entry(node, node.child_text("link"), None))
            .collect()
    } else {
        Vec::new()
    }
}

/// Atom entries may carry several links; prefer `rel=alternate`, then
/// `type=text/html`, keeping document order among equals.
fn atom_entry_link(entry: &XmlNode) -> Option<&str> {
    let mut links: Vec<&XmlNode> = entry.children_named("link").collect();
    links.sort_by_key(|link| {
        let alternate = link
            .attr("rel")
            .is_some_and(|rel| rel.eq_ignore_ascii_case("alternate"));
        let html = link
            .attr("type")
            .is_some_and(|t| t.eq_ignore_ascii_case("text/html"));
        std::cmp::Reverse((alternate, html))
    });
    links
        .into_iter()
        .find_map(|link| link.attr("href").filter(|h| !h.is_empty()))
}
