//! Harvest module - paginated NVD fetching and record normalization.
//!
//! This module provides the core pieces of the harvester:
//! - **Formats**: [`SchemaFormat`] implementations for API v1.0 and v2.0
//! - **Fetcher**: one authenticated page request via [`PageFetcher`]
//! - **Pipeline**: the paginating, retrying driver via [`PaginationDriver`]

pub mod fetcher;
pub mod formats;
pub mod pipeline;
pub mod traits;

// Re-export commonly used types
pub use traits::{format_for, NormalizeError, SchemaFormat};

pub use fetcher::PageFetcher;
pub use formats::{CurrentFormat, LegacyFormat};
pub use pipeline::{
    AbortReason, HarvestReport, HarvestStats, PaginationDriver, PipelineError, RunStatus,
    SkippedItem, StopSignal,
};
