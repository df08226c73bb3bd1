//! Ingestion pipeline: a single consumer that buffers batches from the
//! crawlers and flushes them to storage in bounded groups.
//!
//! Producers hold a [`BatchSender`]; `None` on the queue marks end of input.
//! Posts and asset discoveries are flushed independently once either reaches
//! the batch size, and whatever remains is flushed when the end marker
//! arrives.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::assets::AssetResolver;
use crate::models::{AssetDiscovery, Batch, RawPost};
use crate::storage::{Storage, StorageError};

pub const POSTS_TABLE: &str = "raw_posts";
pub const ASSETS_TABLE: &str = "raw_assets";

/// Errors that stop ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion pipeline is closed")]
    Closed,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("ingestion task failed: {0}")]
    Task(String),
}

/// Producer handle for the pipeline queue.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Option<Batch>>,
}

impl BatchSender {
    pub fn new(tx: mpsc::Sender<Option<Batch>>) -> Self {
        Self { tx }
    }

    /// Enqueue a batch, waiting while the queue is full. Empty batches are
    /// dropped.
    pub async fn send(&self, batch: Batch) -> Result<(), IngestError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Some(batch))
            .await
            .map_err(|_| IngestError::Closed)
    }
}

/// Per-domain totals written by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainCounts {
    pub posts: usize,
    pub assets: usize,
    pub assets_downloaded: usize,
}

/// What the pipeline wrote before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub domains: BTreeMap<String, DomainCounts>,
    pub post_flushes: usize,
    pub asset_flushes: usize,
}

impl IngestReport {
    pub fn total_posts(&self) -> usize {
        self.domains.values().map(|c| c.posts).sum()
    }

    pub fn total_assets(&self) -> usize {
        self.domains.values().map(|c| c.assets).sum()
    }

    fn counts(&mut self, domain: &str) -> &mut DomainCounts {
        self.domains.entry(domain.to_string()).or_default()
    }
}

/// Handle used to shut the pipeline down.
pub struct PipelineHandle {
    tx: mpsc::Sender<Option<Batch>>,
    task: JoinHandle<Result<IngestReport, IngestError>>,
}

impl PipelineHandle {
    /// Send the end marker and wait for the final flush.
    pub async fn finish(self) -> Result<IngestReport, IngestError> {
        // A closed queue means the consumer already stopped; its result says why.
        if self.tx.send(None).await.is_err() {
            debug!("Pipeline consumer already stopped");
        }
        drop(self.tx);
        self.task
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?
    }
}

/// Buffering consumer between crawlers and storage.
pub struct IngestionPipeline {
    storage: Arc<dyn Storage>,
    resolver: AssetResolver,
    batch_size: usize,
    pending_posts: Vec<RawPost>,
    pending_assets: Vec<AssetDiscovery>,
    report: IngestReport,
}

impl IngestionPipeline {
    /// Spawn the consumer. Returns the producer handle and the shutdown handle.
    pub fn start(
        storage: Arc<dyn Storage>,
        resolver: AssetResolver,
        batch_size: usize,
        capacity: usize,
    ) -> (BatchSender, PipelineHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = Self {
            storage,
            resolver,
            batch_size: batch_size.max(1),
            pending_posts: Vec::new(),
            pending_assets: Vec::new(),
            report: IngestReport::default(),
        };
        let task = tokio::spawn(pipeline.run(rx));
        (BatchSender::new(tx.clone()), PipelineHandle { tx, task })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Option<Batch>>) -> Result<IngestReport, IngestError> {
        info!("Ingestion pipeline started (batch size {})", self.batch_size);
        while let Some(item) = rx.recv().await {
            let Some(batch) = item else {
                break;
            };
            self.pending_posts.extend(batch.posts);
            self.pending_assets.extend(batch.assets);

            if self.pending_posts.len() >= self.batch_size {
                self.flush_posts().await?;
            }
            if self.pending_assets.len() >= self.batch_size {
                self.flush_assets().await?;
            }
        }

        self.flush_posts().await?;
        self.flush_assets().await?;
        info!(
            "Ingestion pipeline finished: {} posts, {} assets",
            self.report.total_posts(),
            self.report.total_assets()
        );
        Ok(self.report)
    }

    async fn flush_posts(&mut self) -> Result<(), IngestError> {
        if self.pending_posts.is_empty() {
            return Ok(());
        }
        let posts = std::mem::take(&mut self.pending_posts);
        let rows = posts.iter().map(RawPost::to_row).collect();
        self.storage.insert_rows(POSTS_TABLE, rows).await?;

        for post in &posts {
            self.report.counts(&post.domain).posts += 1;
        }
        self.report.post_flushes += 1;
        debug!("Flushed {} posts", posts.len());
        Ok(())
    }

    async fn flush_assets(&mut self) -> Result<(), IngestError> {
        if self.pending_assets.is_empty() {
            return Ok(());
        }
        let discoveries = std::mem::take(&mut self.pending_assets);
        let assets = self.resolver.resolve(discoveries).await;
        if !assets.is_empty() {
            let rows = assets.iter().map(|a| a.to_row()).collect();
            self.storage.insert_rows(ASSETS_TABLE, rows).await?;
        }

        for asset in &assets {
            let counts = self.report.counts(&asset.domain);
            counts.assets += 1;
            if asset.is_downloaded() {
                counts.assets_downloaded += 1;
            }
        }
        self.report.asset_flushes += 1;
        debug!("Flushed {} assets", assets.len());
        Ok(())
    }
}
