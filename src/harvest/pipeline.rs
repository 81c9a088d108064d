//! Paginated harvest driver.
//!
//! This module provides the [`PaginationDriver`] that walks the remote result
//! set page by page (Fetch → Normalize → Advance) with:
//! - Request pacing and concurrency limits via [`RateGovernor`]
//! - Exponential backoff with jitter for retryable failures
//! - Per-item error isolation during normalization
//! - Cooperative cancellation between pages via [`StopSignal`]
//! - Partial results on abort: records from earlier pages are always returned

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, HarvestConfig};
use crate::governor::{GovernorError, RateGovernor};
use crate::harvest::fetcher::PageFetcher;
use crate::harvest::traits::{format_for, SchemaFormat};
use crate::model::{CanonicalRecord, HarvestCursor, RawPage};
use crate::traits::{FetchError, PageSource};

// ============================================================================
// Run Outcome Types
// ============================================================================

/// Records and statistics of one harvest run.
///
/// Returned for every run, including aborted ones: `records` then holds
/// everything normalized before the abort, in fetch order.
#[derive(Debug)]
pub struct HarvestReport {
    /// Normalized records in fetch order
    pub records: Vec<CanonicalRecord>,

    /// Counters for the run
    pub stats: HarvestStats,

    /// How the run ended
    pub status: RunStatus,
}

impl HarvestReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }
}

/// Statistics about the harvest run.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    /// Pages successfully fetched and decoded
    pub pages_fetched: u64,

    /// Raw items received across all pages
    pub items_received: u64,

    /// Items normalized into records
    pub records_emitted: u64,

    /// Items dropped by normalization, with reasons
    pub skipped: Vec<SkippedItem>,

    /// Retries performed across all pages
    pub retries: u64,

    /// Last total-results count reported by the API
    pub total_known: Option<u64>,

    /// Wall-clock duration of the run (milliseconds)
    pub total_duration_ms: u64,
}

impl HarvestStats {
    pub fn items_skipped(&self) -> usize {
        self.skipped.len()
    }
}

/// An item that failed normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    /// CVE identifier when the raw item exposes one
    pub id: Option<String>,

    /// Human-readable failure reason
    pub reason: String,
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum RunStatus {
    /// Every page up to the reported total was processed
    Completed,

    /// Stopped early for a reason that may clear up later
    /// (retries exhausted, cancellation)
    PartialAborted(AbortReason),

    /// Stopped on an error retrying cannot fix (credentials, malformed body)
    FatalAborted(AbortReason),
}

#[derive(Error, Debug)]
pub enum AbortReason {
    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: FetchError },

    #[error("Fatal fetch error: {0}")]
    Fatal(FetchError),

    #[error("Rate governor failed: {0}")]
    Governor(#[from] GovernorError),

    #[error("Stop requested")]
    Cancelled,
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors that prevent a run from starting.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP client could not be constructed
    #[error("Client setup failed: {0}")]
    Client(#[from] FetchError),
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative stop flag, checked between pages.
///
/// Clones share the same flag. A fetch already in flight is allowed to
/// finish and its page is normalized before the run stops.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Pagination Driver
// ============================================================================

/// Driver states. Data produced by one state travels with the next.
#[derive(Debug)]
enum Phase {
    Idle,
    Fetching { attempt: u32 },
    Normalizing(RawPage),
    Advancing,
    Done,
    Aborted(RunStatus),
}

/// Walks the NVD result set one page at a time.
///
/// Pages are strictly sequential: page N+1 is not requested until page N
/// has been normalized, and the cursor never moves backwards, so no page is
/// requested twice in one run except as a retry of a failed attempt.
///
/// # Example
///
/// ```ignore
/// use nvd_harvester::{HarvestConfig, PaginationDriver, SchemaVersion};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = HarvestConfig::new(SchemaVersion::Current)
///         .with_api_key("...")
///         .with_keyword("openssl", false);
///     let driver = PaginationDriver::from_config(config)?;
///
///     let report = driver.run().await;
///     println!("{} records, status {:?}", report.records.len(), report.status);
///     Ok(())
/// }
/// ```
pub struct PaginationDriver<S>
where
    S: PageSource,
{
    /// Page source (HTTP fetcher in production)
    source: S,

    /// Shared run configuration
    config: Arc<HarvestConfig>,

    /// Request pacing
    governor: RateGovernor,

    /// Extraction rules for the configured schema
    format: &'static dyn SchemaFormat,

    stop: StopSignal,
}

impl PaginationDriver<PageFetcher> {
    /// Validates `config` and builds a driver backed by the HTTP fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: HarvestConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let config = Arc::new(config);
        let fetcher = PageFetcher::new(Arc::clone(&config))?;
        Self::new(fetcher, config)
    }
}

impl<S> PaginationDriver<S>
where
    S: PageSource,
{
    /// Creates a driver over an arbitrary page source.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if `config` fails validation.
    pub fn new(source: S, config: Arc<HarvestConfig>) -> Result<Self, PipelineError> {
        config.validate()?;
        let governor = RateGovernor::new(config.concurrency, config.min_interval());
        Ok(Self {
            source,
            format: format_for(config.schema),
            governor,
            config,
            stop: StopSignal::new(),
        })
    }

    /// Uses an externally owned stop flag.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Handle for requesting a stop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Runs the harvest to completion or abort.
    ///
    /// Never fails outright: errors end the run with an aborted
    /// [`RunStatus`] and the records gathered so far.
    #[instrument(skip(self), fields(schema = %self.format.version()))]
    pub async fn run(&self) -> HarvestReport {
        let start = Instant::now();
        let mut cursor = HarvestCursor::new(self.config.effective_page_size());
        let mut records = Vec::new();
        let mut stats = HarvestStats::default();

        info!(
            format = self.format.name(),
            page_size = cursor.page_size,
            "Starting harvest"
        );

        let mut phase = Phase::Idle;
        let status = loop {
            phase = match phase {
                Phase::Idle => {
                    if self.stop.is_stopped() {
                        Phase::Aborted(RunStatus::PartialAborted(AbortReason::Cancelled))
                    } else {
                        Phase::Fetching { attempt: 0 }
                    }
                }

                Phase::Fetching { attempt } => match self.fetch_page(&cursor).await {
                    Ok(page) => {
                        stats.pages_fetched += 1;
                        Phase::Normalizing(page)
                    }
                    Err(FetchFailure::Governor(e)) => {
                        Phase::Aborted(RunStatus::FatalAborted(AbortReason::Governor(e)))
                    }
                    Err(FetchFailure::Fetch(e)) => {
                        self.on_fetch_error(e, attempt, &cursor, &mut stats).await
                    }
                },

                Phase::Normalizing(page) => {
                    if cursor.total_known.is_some_and(|total| total != page.total_results) {
                        info!(
                            previous = cursor.total_known,
                            total = page.total_results,
                            "Total results changed during run"
                        );
                    }
                    cursor.total_known = Some(page.total_results);
                    stats.total_known = cursor.total_known;

                    self.normalize_page(&page, &mut records, &mut stats);

                    info!(
                        offset = cursor.offset,
                        total = page.total_results,
                        "Progress: {}/{}",
                        (cursor.offset + page.items.len() as u64).min(page.total_results),
                        page.total_results
                    );
                    Phase::Advancing
                }

                Phase::Advancing => {
                    if cursor.is_last_page() {
                        Phase::Done
                    } else if self.stop.is_stopped() {
                        info!(offset = cursor.offset, "Stop requested, ending run");
                        Phase::Aborted(RunStatus::PartialAborted(AbortReason::Cancelled))
                    } else {
                        cursor.advance();
                        Phase::Fetching { attempt: 0 }
                    }
                }

                Phase::Done => break RunStatus::Completed,

                Phase::Aborted(status) => break status,
            };
        };

        stats.total_duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &status {
            RunStatus::Completed => info!(
                records = stats.records_emitted,
                skipped = stats.items_skipped(),
                duration_ms = stats.total_duration_ms,
                "Harvest completed"
            ),
            RunStatus::PartialAborted(reason) | RunStatus::FatalAborted(reason) => warn!(
                records = stats.records_emitted,
                skipped = stats.items_skipped(),
                offset = cursor.offset,
                "Harvest aborted: {}",
                reason
            ),
        }

        HarvestReport {
            records,
            stats,
            status,
        }
    }

    /// One governed request. The permit is held until the response is in.
    async fn fetch_page(&self, cursor: &HarvestCursor) -> Result<RawPage, FetchFailure> {
        let _permit = self.governor.acquire().await?;
        Ok(self.source.fetch(cursor, self.format.version()).await?)
    }

    /// Decides between retrying the current page and aborting the run.
    async fn on_fetch_error(
        &self,
        error: FetchError,
        attempt: u32,
        cursor: &HarvestCursor,
        stats: &mut HarvestStats,
    ) -> Phase {
        if !error.is_retryable() {
            warn!(offset = cursor.offset, "Fatal fetch error: {}", error);
            return Phase::Aborted(RunStatus::FatalAborted(AbortReason::Fatal(error)));
        }

        if attempt >= self.config.max_retries {
            return Phase::Aborted(RunStatus::PartialAborted(AbortReason::RetriesExhausted {
                attempts: attempt + 1,
                last_error: error,
            }));
        }

        let retry = attempt + 1;
        let delay = with_jitter(backoff_delay(
            self.config.retry_base_delay(),
            self.config.max_retry_delay(),
            retry,
            &error,
        ));
        warn!(
            offset = cursor.offset,
            attempt = retry,
            delay_ms = delay.as_millis() as u64,
            "Retrying page after error: {}",
            error
        );
        stats.retries += 1;
        tokio::time::sleep(delay).await;
        Phase::Fetching { attempt: retry }
    }

    /// Normalizes every item of a page; failures are recorded and skipped.
    fn normalize_page(
        &self,
        page: &RawPage,
        records: &mut Vec<CanonicalRecord>,
        stats: &mut HarvestStats,
    ) {
        stats.items_received += page.items.len() as u64;

        for item in &page.items {
            match self.format.normalize(item) {
                Ok(record) => {
                    records.push(record);
                    stats.records_emitted += 1;
                }
                Err(e) => {
                    let id = self.format.item_id(item);
                    warn!(cve_id = id.as_deref().unwrap_or("<unknown>"), "Skipping item: {}", e);
                    stats.skipped.push(SkippedItem {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            received = page.items.len(),
            emitted = stats.records_emitted,
            "Page normalized"
        );
    }
}

#[derive(Debug, Error)]
enum FetchFailure {
    #[error(transparent)]
    Governor(#[from] GovernorError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Backoff before retry number `retry` (1-based), without jitter.
///
/// Doubles per retry from `base`; rate limiting starts four times higher and
/// never waits less than the server's `Retry-After`. Capped at `max`.
fn backoff_delay(base: Duration, max: Duration, retry: u32, error: &FetchError) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    let mut delay = base.saturating_mul(1u32 << exponent);

    if let FetchError::RateLimited { retry_after } = error {
        delay = delay.saturating_mul(4);
        if let Some(after) = retry_after {
            delay = delay.max(*after);
        }
    }

    delay.min(max)
}

/// Adds up to half of `delay` at random.
fn with_jitter(delay: Duration) -> Duration {
    let half = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / 2;
    if half == 0 {
        return delay;
    }
    delay.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=half)))
}

// ============================================================================
// Tests
// ============================================================================
