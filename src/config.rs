//! Run configuration for the harvester.
//!
//! A [`HarvestConfig`] is built once at run start, either from TOML or with
//! the `with_*` setters, and then shared by reference with the fetcher, the
//! governor and the pagination driver.

use crate::model::SchemaVersion;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Harvest run settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// API generation targeted by the whole run
    pub schema: SchemaVersion,

    /// Endpoint override; defaults to the public NVD endpoint for `schema`
    pub base_url: Option<String>,

    /// NVD API key, sent as `apiKey` (legacy) or bearer token (current)
    pub api_key: Option<String>,

    /// Requested `resultsPerPage`; clamped to the schema maximum.
    /// `None` means "the schema maximum".
    pub page_size: Option<u32>,

    /// Minimum spacing between request starts, in milliseconds
    pub min_interval_ms: u64,

    /// Maximum outstanding requests
    pub concurrency: usize,

    /// Retries after the first attempt of a page
    pub max_retries: u32,

    /// First backoff step, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Upper bound for any single backoff, in milliseconds
    pub max_retry_delay_ms: u64,

    /// Per-request timeout, in milliseconds
    pub request_timeout_ms: u64,

    /// Optional keyword filter
    pub keyword: Option<String>,

    /// Require an exact phrase match for `keyword`
    pub exact_match: bool,

    /// Exclude rejected CVEs (current schema only)
    pub no_rejected: bool,

    pub user_agent: String,

    /// Largest response body accepted, in bytes
    pub max_response_bytes: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            schema: SchemaVersion::Current,
            base_url: None,
            api_key: None,
            page_size: None,
            min_interval_ms: 6_000, // NVD public quota: 5 requests per 30s
            concurrency: 2,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            request_timeout_ms: 30_000,
            keyword: None,
            exact_match: false,
            no_rejected: false,
            user_agent: format!("nvd-harvester/{}", env!("CARGO_PKG_VERSION")),
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

// The API key never reaches logs.
impl fmt::Debug for HarvestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestConfig")
            .field("schema", &self.schema)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("page_size", &self.page_size)
            .field("min_interval_ms", &self.min_interval_ms)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("keyword", &self.keyword)
            .field("exact_match", &self.exact_match)
            .field("no_rejected", &self.no_rejected)
            .field("user_agent", &self.user_agent)
            .field("max_response_bytes", &self.max_response_bytes)
            .finish()
    }
}

impl HarvestConfig {
    /// Creates a default configuration for the given API generation.
    pub fn new(schema: SchemaVersion) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse,
    /// or fails [`HarvestConfig::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string. Missing keys take defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = millis(interval);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = millis(base);
        self.max_retry_delay_ms = millis(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    /// Filters results by keyword; `exact` requests a phrase match.
    pub fn with_keyword(mut self, keyword: impl Into<String>, exact: bool) -> Self {
        self.keyword = Some(keyword.into());
        self.exact_match = exact;
        self
    }

    pub fn with_no_rejected(mut self, no_rejected: bool) -> Self {
        self.no_rejected = no_rejected;
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.schema.default_base_url())
    }

    /// Page size actually requested: configured value kept within
    /// `1..=` the API maximum, so the cursor always moves forward.
    pub fn effective_page_size(&self) -> u32 {
        let max = self.schema.max_page_size();
        self.page_size.map_or(max, |size| size.clamp(1, max))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Checks the settings for combinations the run cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == Some(0) {
            return Err(ConfigError::Invalid("page_size must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.exact_match && self.keyword.is_none() {
            return Err(ConfigError::Invalid(
                "exact_match requires a keyword".to_string(),
            ));
        }
        Url::parse(self.base_url())
            .map_err(|e| ConfigError::Invalid(format!("base_url '{}': {}", self.base_url(), e)))?;
        Ok(())
    }
}

// Saturates instead of wrapping for absurdly long durations.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
