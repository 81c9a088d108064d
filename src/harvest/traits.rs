//! Core traits and types for schema-specific record handling.
//!
//! Each NVD API generation is handled by its own [`SchemaFormat`]
//! implementation. The two shapes share nothing beyond the output
//! [`CanonicalRecord`], so they are kept side by side rather than merged
//! behind conditionals:
//! - Request shaping via [`SchemaFormat::apply_query`] and [`SchemaFormat::auth_header`]
//! - Envelope decoding via [`SchemaFormat::decode_page`]
//! - Field extraction via [`SchemaFormat::normalize`]

use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

use crate::config::HarvestConfig;
use crate::harvest::formats::{CurrentFormat, LegacyFormat};
use crate::model::{CanonicalRecord, HarvestCursor, RawPage, SchemaVersion};

// ============================================================================
// Schema Format Trait
// ============================================================================

/// Abstraction over one generation of the NVD CVE API.
///
/// # Thread Safety
///
/// Implementations are stateless and must be `Send + Sync`; the pipeline
/// shares a single `&'static` instance for the whole run.
pub trait SchemaFormat: Send + Sync {
    /// API generation handled by this format.
    fn version(&self) -> SchemaVersion;

    /// Short identifier used in logs.
    ///
    /// Examples: `"nvd-v1.0"`, `"nvd-v2.0"`
    fn name(&self) -> &'static str;

    /// Appends pagination and filter parameters for one page request.
    ///
    /// # Arguments
    ///
    /// * `url` - Base endpoint; parameters are appended, never replaced
    /// * `cursor` - Page position (`startIndex` / `resultsPerPage`)
    /// * `config` - Optional filters (keyword, exact match, rejected filter)
    fn apply_query(&self, url: &mut Url, cursor: &HarvestCursor, config: &HarvestConfig);

    /// Header carrying the API credential.
    ///
    /// Returns the header name and its value.
    fn auth_header(&self, api_key: &str) -> (&'static str, String);

    /// Decodes a response body into a [`RawPage`].
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the body is not JSON or lacks the
    /// total-results count. A missing item array is an empty page.
    fn decode_page(&self, body: &[u8]) -> Result<RawPage, serde_json::Error>;

    /// Maps one raw item into a [`CanonicalRecord`].
    ///
    /// # Idempotence
    ///
    /// Normalization is a pure function of `item`: the same input always
    /// yields the same record.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError`] if:
    /// - The item does not have the schema's shape
    /// - A mandatory timestamp is missing or unparsable
    fn normalize(&self, item: &Value) -> Result<CanonicalRecord, NormalizeError>;

    /// Best-effort identifier of a raw item, for skip reporting.
    fn item_id(&self, item: &Value) -> Option<String>;
}

/// Returns the format implementation for `schema`.
pub fn format_for(schema: SchemaVersion) -> &'static dyn SchemaFormat {
    match schema {
        SchemaVersion::Legacy => &LegacyFormat,
        SchemaVersion::Current => &CurrentFormat,
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while normalizing a single item.
///
/// These never abort a page: the pipeline counts the item as skipped and
/// moves on to its siblings.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// Item is not an object of the expected schema shape
    #[error("Item does not match the {schema} shape: {source}")]
    Shape {
        schema: SchemaVersion,
        #[source]
        source: serde_json::Error,
    },

    /// Mandatory field is absent
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// Timestamp field could not be parsed
    #[error("Malformed timestamp in '{field}': '{value}'")]
    MalformedTimestamp { field: &'static str, value: String },
}

// ============================================================================
// Tests
// ============================================================================
