//! Post extraction from timeline GraphQL payloads.
//!
//! The timeline API nests tweet nodes at varying depths and renames wrappers
//! between schema versions. Extraction walks the documented timeline path
//! first, then falls back to an exhaustive traversal that accepts any node
//! shaped like a post. Both walks use explicit worklists.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::AssetType;

const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";
const RESULT_KEYS: [&str; 2] = ["tweet_results", "tweetResult"];
const WRAPPER_KEYS: [&str; 2] = ["tweet", "result"];

/// An asset referenced by a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAsset {
    pub url: String,
    pub asset_type: AssetType,
    pub should_download: bool,
}

/// A post located inside a payload.
#[derive(Debug, Clone)]
pub struct ExtractedPost {
    pub post_id: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub url: String,
    pub text: Option<String>,
    /// The tweet node itself.
    pub payload: Value,
    pub assets: Vec<ExtractedAsset>,
}

fn as_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

fn as_array(value: Option<&Value>) -> Option<&Vec<Value>> {
    value.and_then(Value::as_array)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Walk an object along `path`, requiring every hop to be an object.
fn object_at<'a>(node: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Map<String, Value>> {
    path.iter()
        .try_fold(node, |current, key| as_object(current.get(*key)))
}

/// Extract every distinct post from a payload. Never fails: a payload with
/// no recognizable shape yields an empty list.
pub fn extract_posts_from_payload(payload: &Value) -> Vec<ExtractedPost> {
    let Some(root) = payload.as_object() else {
        return Vec::new();
    };

    let mut posts: Vec<ExtractedPost> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for node in collect_tweet_nodes(root) {
        let Some(post) = parse_tweet(node) else {
            continue;
        };
        match index.get(&post.post_id) {
            Some(&slot) => posts[slot] = post,
            None => {
                index.insert(post.post_id.clone(), posts.len());
                posts.push(post);
            }
        }
    }

    posts
}

fn collect_tweet_nodes(root: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let mut results = timeline_tweet_nodes(root);
    let mut stack: Vec<&Value> = root.values().filter(|v| is_container(v)).collect();

    results.extend(tweet_results_of(root));
    if looks_like_tweet(root) {
        results.push(root);
    }

    while let Some(current) = stack.pop() {
        match current {
            Value::Object(map) => {
                results.extend(tweet_results_of(map));
                if looks_like_tweet(map) {
                    results.push(map);
                }
                stack.extend(map.values().filter(|v| is_container(v)));
            }
            Value::Array(items) => {
                stack.extend(items.iter().filter(|v| is_container(v)));
            }
            _ => {}
        }
    }

    results
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

fn timeline_tweet_nodes(root: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let Some(timeline) = object_at(
        root,
        &["data", "user", "result", "timeline", "timeline"],
    ) else {
        return Vec::new();
    };
    let Some(instructions) = as_array(timeline.get("instructions")) else {
        return Vec::new();
    };

    let mut extracted = Vec::new();
    for instruction in instructions.iter().filter_map(Value::as_object) {
        if instruction.get("type").and_then(Value::as_str) != Some("TimelineAddEntries") {
            continue;
        }
        let Some(entries) = as_array(instruction.get("entries")) else {
            continue;
        };
        for entry in entries.iter().filter_map(Value::as_object) {
            extracted.extend(entry_tweet_nodes(entry));
        }
    }
    extracted
}

fn entry_tweet_nodes(entry: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let Some(content) = as_object(entry.get("content")) else {
        return Vec::new();
    };

    match content.get("entryType").and_then(Value::as_str) {
        Some("TimelineTimelineItem") => item_content_nodes(as_object(content.get("itemContent"))),
        Some("TimelineTimelineModule") => {
            let Some(items) = as_array(content.get("items")) else {
                return Vec::new();
            };
            items
                .iter()
                .filter_map(Value::as_object)
                .flat_map(|item| {
                    let node = as_object(item.get("item")).unwrap_or(item);
                    item_content_nodes(as_object(node.get("itemContent")))
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

fn item_content_nodes(item_content: Option<&Map<String, Value>>) -> Vec<&Map<String, Value>> {
    let Some(item_content) = item_content else {
        return Vec::new();
    };
    match item_content.get("itemType") {
        None | Some(Value::Null) => {}
        Some(Value::String(kind)) if kind == "TimelineTweet" => {}
        Some(_) => return Vec::new(),
    }
    tweet_results_of(item_content)
}

fn tweet_results_of(node: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    RESULT_KEYS
        .iter()
        .filter_map(|key| as_object(node.get(*key)))
        .filter_map(|wrapper| as_object(wrapper.get("result")))
        .map(|result| unwrap_tweet(result).unwrap_or(result))
        .collect()
}

/// Peel `tweet`/`result` wrappers until a post-shaped node appears.
fn unwrap_tweet(result: &Map<String, Value>) -> Option<&Map<String, Value>> {
    let mut stack = vec![result];
    while let Some(current) = stack.pop() {
        if looks_like_tweet(current) {
            return Some(current);
        }
        stack.extend(
            WRAPPER_KEYS
                .iter()
                .filter_map(|key| as_object(current.get(*key))),
        );
    }
    None
}

fn looks_like_tweet(node: &Map<String, Value>) -> bool {
    if node.get("__typename").and_then(Value::as_str) == Some("Tweet") {
        return true;
    }
    if as_object(node.get("note_tweet")).is_some() {
        return true;
    }
    let Some(legacy) = as_object(node.get("legacy")) else {
        return false;
    };
    legacy.get("full_text").is_some_and(Value::is_string)
        || legacy.get("conversation_id_str").is_some_and(Value::is_string)
}

fn parse_tweet(node: &Map<String, Value>) -> Option<ExtractedPost> {
    let tweet = unwrap_tweet(node).unwrap_or(node);
    let post_id = post_id_of(tweet)?;
    let author = author_of(tweet);
    let url = build_post_url(&author, &post_id);

    Some(ExtractedPost {
        created_at: created_at_of(tweet),
        text: text_of(tweet),
        assets: assets_of(tweet),
        payload: Value::Object(tweet.clone()),
        post_id,
        author,
        url,
    })
}

fn post_id_of(tweet: &Map<String, Value>) -> Option<String> {
    non_empty_str(tweet.get("rest_id"))
        .or_else(|| non_empty_str(as_object(tweet.get("legacy"))?.get("id_str")))
        .map(str::to_string)
}

fn author_of(tweet: &Map<String, Value>) -> String {
    let Some(user) = object_at(tweet, &["core", "user_results", "result"]) else {
        return String::new();
    };
    ["legacy", "core"]
        .iter()
        .filter_map(|key| as_object(user.get(*key)))
        .find_map(|section| non_empty_str(section.get("screen_name")))
        .unwrap_or_default()
        .to_string()
}

fn created_at_of(tweet: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = as_object(tweet.get("legacy"))?
        .get("created_at")
        .and_then(Value::as_str)?;
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn text_of(tweet: &Map<String, Value>) -> Option<String> {
    if let Some(text) = as_object(tweet.get("legacy"))
        .and_then(|legacy| legacy.get("full_text"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }
    object_at(tweet, &["note_tweet", "note_tweet_results", "result"])
        .and_then(|result| result.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Canonical permalink for a post.
pub fn build_post_url(author: &str, post_id: &str) -> String {
    if author.is_empty() {
        format!("https://x.com/i/status/{post_id}")
    } else {
        format!("https://x.com/{author}/status/{post_id}")
    }
}

fn assets_of(tweet: &Map<String, Value>) -> Vec<ExtractedAsset> {
    let Some(legacy) = as_object(tweet.get("legacy")) else {
        return Vec::new();
    };

    let mut assets = Vec::new();
    if let Some(entities) = as_object(legacy.get("entities")) {
        assets.extend(link_assets(entities));
        assets.extend(media_assets(entities));
    }
    if let Some(extended) = as_object(legacy.get("extended_entities")) {
        assets.extend(media_assets(extended));
    }

    let mut seen = HashSet::new();
    assets.retain(|asset| !asset.url.is_empty() && seen.insert(asset.url.clone()));
    assets
}

fn link_assets(entities: &Map<String, Value>) -> Vec<ExtractedAsset> {
    as_array(entities.get("urls"))
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|item| non_empty_str(item.get("expanded_url")))
        .map(|url| ExtractedAsset {
            url: url.to_string(),
            asset_type: AssetType::Link,
            should_download: false,
        })
        .collect()
}

fn media_assets(entities: &Map<String, Value>) -> Vec<ExtractedAsset> {
    let mut assets = Vec::new();

    for item in as_array(entities.get("media"))
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
    {
        let media_url = non_empty_str(item.get("media_url_https"))
            .or_else(|| non_empty_str(item.get("media_url")));
        let media_type = non_empty_str(item.get("type")).unwrap_or("media");
        let is_video = matches!(media_type, "video" | "animated_gif");

        if let Some(url) = media_url {
            // Videos and GIFs expose their poster frame here; the playable
            // files come from the variants below.
            let asset_type = if is_video {
                AssetType::Image
            } else {
                AssetType::parse(media_type)
            };
            assets.push(ExtractedAsset {
                url: url.to_string(),
                should_download: asset_type.is_downloadable(),
                asset_type,
            });
        }

        if is_video {
            if let Some(video_info) = as_object(item.get("video_info")) {
                assets.extend(video_variants(video_info));
            }
        }
    }

    assets
}

fn video_variants(video_info: &Map<String, Value>) -> Vec<ExtractedAsset> {
    as_array(video_info.get("variants"))
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter(|variant| {
            variant
                .get("content_type")
                .and_then(Value::as_str)
                .is_some_and(|ct| ct.contains("video"))
        })
        .filter_map(|variant| non_empty_str(variant.get("url")))
        .map(|url| ExtractedAsset {
            url: url.to_string(),
            asset_type: AssetType::Video,
            should_download: true,
        })
        .collect()
}
