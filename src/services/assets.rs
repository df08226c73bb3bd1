//! Asset resolution: turns discoveries into `RawAsset` records, downloading
//! media to `assets_dir/<domain>/<post_id>/<filename>`.
//!
//! The filename carries a short digest of the URL, so two URLs that end in
//! the same segment never share a file or a temp file.
//!
//! Downloads stream into a `.part` file next to the target and are renamed
//! into place only once complete and within the size limit, so a non-empty
//! `local_path` always names a whole file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::models::{AssetDiscovery, RawAsset};
use crate::scrapers::{FetchError, Fetcher};

const FALLBACK_FILENAME: &str = "asset";
const URL_TAG_LEN: usize = 10;

/// Where and how assets are downloaded.
#[derive(Debug, Clone)]
pub struct AssetResolverConfig {
    pub assets_dir: PathBuf,
    /// Largest file kept; `None` means unlimited.
    pub max_asset_bytes: Option<u64>,
    pub concurrency: usize,
}

impl AssetResolverConfig {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            max_asset_bytes: None,
            concurrency: 4,
        }
    }
}

/// Result of a single download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Download {
    Saved,
    Existing,
    TooLarge,
}

/// Replace anything that is not safe in a single path component.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn url_tag(asset_url: &str) -> String {
    let mut tag = hex::encode(Sha256::digest(asset_url.as_bytes()));
    tag.truncate(URL_TAG_LEN);
    tag
}

/// Filename for an asset URL: the decoded last path segment, sanitized, with
/// a digest of the full URL inserted before the extension.
pub fn filename_for_url(asset_url: &str) -> String {
    let segment = url::Url::parse(asset_url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    let name = sanitize_component(&decoded);
    let tag = url_tag(asset_url);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!("{}-{}.{}", stem, tag, ext)
        }
        _ => format!("{}-{}", name, tag),
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Downloads and records discovered assets.
#[derive(Clone)]
pub struct AssetResolver {
    fetcher: Arc<dyn Fetcher>,
    config: AssetResolverConfig,
}

impl AssetResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: AssetResolverConfig) -> Self {
        Self { fetcher, config }
    }

    /// Deterministic on-disk location for a discovery.
    pub fn target_path(&self, discovery: &AssetDiscovery) -> PathBuf {
        self.config
            .assets_dir
            .join(sanitize_component(&discovery.domain))
            .join(sanitize_component(&discovery.post_id))
            .join(filename_for_url(&discovery.url))
    }

    /// Resolve discoveries into records, first occurrence of each URL wins.
    /// Failures are isolated per asset and yield a not-downloaded record.
    pub async fn resolve(&self, discoveries: Vec<AssetDiscovery>) -> Vec<RawAsset> {
        let mut seen = HashSet::new();
        let unique: Vec<AssetDiscovery> = discoveries
            .into_iter()
            .filter(|d| seen.insert(d.url.clone()))
            .collect();
        if unique.is_empty() {
            return Vec::new();
        }

        let total = unique.len();
        let resolved: Vec<RawAsset> = stream::iter(unique)
            .map(|discovery| self.resolve_one(discovery))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let downloaded = resolved.iter().filter(|a| a.is_downloaded()).count();
        info!("Resolved {} assets ({} on disk)", total, downloaded);
        resolved
    }

    async fn resolve_one(&self, discovery: AssetDiscovery) -> RawAsset {
        let record = RawAsset::from_discovery(&discovery, Utc::now());
        if !discovery.asset_type.is_downloadable() {
            return record;
        }

        let path = self.target_path(&discovery);
        match self.download(&discovery.url, &path).await {
            Ok(Download::Saved) | Ok(Download::Existing) => {
                record.with_local_path(path.to_string_lossy().into_owned())
            }
            Ok(Download::TooLarge) => {
                info!("Skipping {}: larger than the asset size limit", discovery.url);
                record
            }
            Err(e) => {
                warn!("Failed to download {}: {}", discovery.url, e);
                record
            }
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<Download, FetchError> {
        if fs::try_exists(path).await? {
            debug!("Reusing {}", path.display());
            return Ok(Download::Existing);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut body = self.fetcher.open(url).await?;
        let limit = self.config.max_asset_bytes;
        if let (Some(limit), Some(declared)) = (limit, body.content_length()) {
            if declared > limit {
                return Ok(Download::TooLarge);
            }
        }

        let temp = part_path(path);
        let result = async {
            let mut file = fs::File::create(&temp).await?;
            let mut written: u64 = 0;
            while let Some(chunk) = body.next_chunk().await? {
                written += chunk.len() as u64;
                if limit.is_some_and(|limit| written > limit) {
                    return Ok(Download::TooLarge);
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<_, FetchError>(Download::Saved)
        }
        .await;

        match result {
            Ok(Download::Saved) => match fs::rename(&temp, path).await {
                Ok(()) => {
                    debug!("Saved {} to {}", url, path.display());
                    Ok(Download::Saved)
                }
                Err(e) => {
                    discard(&temp).await;
                    Err(e.into())
                }
            },
            other => {
                discard(&temp).await;
                other
            }
        }
    }
}

async fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp).await {
        debug!("Could not remove {}: {}", temp.display(), e);
    }
}
