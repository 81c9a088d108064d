use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which generation of the NVD CVE API a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// `/rest/json/cves/1.0` (`CVE_Items` envelope)
    Legacy,
    /// `/rest/json/cves/2.0` (`vulnerabilities` envelope)
    #[default]
    Current,
}

impl SchemaVersion {
    /// Largest `resultsPerPage` the API accepts for this generation.
    pub fn max_page_size(self) -> u32 {
        match self {
            SchemaVersion::Legacy => 200,
            SchemaVersion::Current => 2000,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            SchemaVersion::Legacy => "https://services.nvd.nist.gov/rest/json/cves/1.0/",
            SchemaVersion::Current => "https://services.nvd.nist.gov/rest/json/cves/2.0",
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Legacy => f.write_str("v1.0"),
            SchemaVersion::Current => f.write_str("v2.0"),
        }
    }
}

/// Position of a run within the remote result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestCursor {
    pub offset: u64,
    pub page_size: u32,
    pub total_known: Option<u64>, // None until the first page answers
}

impl HarvestCursor {
    pub fn new(page_size: u32) -> Self {
        Self {
            offset: 0,
            page_size,
            total_known: None,
        }
    }

    /// True when the page starting at `offset` is the last one of `total_known`.
    pub fn is_last_page(&self) -> bool {
        match self.total_known {
            Some(total) => self.offset + u64::from(self.page_size) >= total,
            None => false,
        }
    }

    /// Moves to the next page. Offsets only ever grow.
    pub fn advance(&mut self) {
        self.offset += u64::from(self.page_size);
    }
}

/// One decoded response envelope. Items stay untyped so a single bad item
/// cannot poison the page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub total_results: u64,
    pub items: Vec<serde_json::Value>,
}

/// Normalized vulnerability record, identical across API generations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub cve_id: String,      // CVE-2023-XXXX
    pub vuln_status: String, // "Analyzed", "Modified", ... (empty on legacy)
    pub published: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub description: String, // English variant, empty if none
    pub references: Vec<Reference>,
    pub cwe_ids: Option<Vec<String>>,
    pub affected_products: Vec<String>,
    pub cvss_v2: Option<CvssScore>,
    pub cvss_v3: Option<CvssScore>,
}

impl CanonicalRecord {
    /// Reference URLs tagged as patches.
    pub fn patch_links(&self) -> Vec<&str> {
        self.references
            .iter()
            .filter(|r| r.tags.iter().any(|t| t == "Patch"))
            .map(|r| r.url.as_str())
            .collect()
    }

    /// First reference that points at a source repository.
    pub fn source_repository(&self) -> Option<&str> {
        self.references
            .iter()
            .map(|r| r.url.as_str())
            .find(|url| url.contains("github.com") || url.contains("git"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub url: String,
    pub tags: Vec<String>, // "Patch", "Vendor Advisory", ...
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssScore {
    pub base_score: f64,
    pub vector_string: String,
    pub severity: Option<String>, // "HIGH", "MEDIUM", ...
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_with_refs(refs: Vec<Reference>) -> CanonicalRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        CanonicalRecord {
            cve_id: "CVE-2024-0001".to_string(),
            vuln_status: String::new(),
            published: ts,
            last_modified: ts,
            description: String::new(),
            references: refs,
            cwe_ids: None,
            affected_products: vec![],
            cvss_v2: None,
            cvss_v3: None,
        }
    }

    #[test]
    fn test_cursor_last_page_boundaries() {
        let mut cursor = HarvestCursor::new(2);
        assert!(!cursor.is_last_page());

        cursor.total_known = Some(5);
        assert!(!cursor.is_last_page());
        cursor.advance();
        assert_eq!(cursor.offset, 2);
        assert!(!cursor.is_last_page());
        cursor.advance();
        assert_eq!(cursor.offset, 4);
        assert!(cursor.is_last_page());
    }

    #[test]
    fn test_cursor_exact_multiple() {
        let cursor = HarvestCursor {
            offset: 2,
            page_size: 2,
            total_known: Some(4),
        };
        assert!(cursor.is_last_page());
    }

    #[test]
    fn test_schema_limits() {
        assert_eq!(SchemaVersion::Legacy.max_page_size(), 200);
        assert_eq!(SchemaVersion::Current.max_page_size(), 2000);
        assert_eq!(SchemaVersion::default(), SchemaVersion::Current);
    }

    #[test]
    fn test_patch_links_and_source_repository() {
        let record = record_with_refs(vec![
            Reference {
                url: "https://vendor.example/advisory".to_string(),
                tags: vec!["Vendor Advisory".to_string()],
            },
            Reference {
                url: "https://github.com/acme/widget/commit/abc".to_string(),
                tags: vec!["Patch".to_string(), "Third Party Advisory".to_string()],
            },
        ]);

        assert_eq!(
            record.patch_links(),
            vec!["https://github.com/acme/widget/commit/abc"]
        );
        assert_eq!(
            record.source_repository(),
            Some("https://github.com/acme/widget/commit/abc")
        );
    }

    #[test]
    fn test_source_repository_absent() {
        let record = record_with_refs(vec![Reference {
            url: "https://vendor.example/advisory".to_string(),
            tags: vec![],
        }]);
        assert!(record.source_repository().is_none());
        assert!(record.patch_links().is_empty());
    }
}
