//! NVD API schema implementations.
//!
//! - `current` - API 2.0 (`vulnerabilities[].cve`)
//! - `legacy` - API 1.0 (`result.CVE_Items[]`)

mod current;
mod legacy;

pub use current::CurrentFormat;
pub use legacy::LegacyFormat;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::harvest::traits::NormalizeError;

/// Offset-less layouts seen in NVD payloads; values are taken as UTC.
const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%MZ",
    "%Y-%m-%dT%H:%M",
];

pub(crate) fn parse_timestamp(
    field: &'static str,
    raw: Option<&str>,
) -> Result<DateTime<Utc>, NormalizeError> {
    let value = raw.ok_or(NormalizeError::MissingField(field))?.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(NormalizeError::MalformedTimestamp {
        field,
        value: value.to_string(),
    })
}
