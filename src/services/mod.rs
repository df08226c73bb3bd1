//! Service layer: asset resolution, ingestion, and run orchestration.
//!
//! The crawlers in [`crate::scrapers`] produce batches; the services here
//! turn them into stored rows and downloaded files.

pub mod assets;
pub mod ingest;
pub mod runner;

pub use assets::{AssetResolver, AssetResolverConfig};
pub use ingest::{BatchSender, DomainCounts, IngestError, IngestReport, IngestionPipeline, PipelineHandle};
#[cfg(feature = "browser")]
pub use runner::run_scrape;
pub use runner::{browser_options, RunError, RunReport, Runner, SourceOutcome};
