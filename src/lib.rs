pub mod config;
pub mod governor;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use config::*;
pub use governor::*;
pub use harvest::{
    AbortReason, HarvestReport, HarvestStats, PageFetcher, PaginationDriver, PipelineError,
    RunStatus, SkippedItem, StopSignal,
};
pub use model::*;
pub use traits::*;
