//! NVD CVE API 2.0.

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

use super::parse_timestamp;
use crate::config::HarvestConfig;
use crate::harvest::traits::{NormalizeError, SchemaFormat};
use crate::model::{CanonicalRecord, CvssScore, HarvestCursor, RawPage, Reference, SchemaVersion};

#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentFormat;

impl SchemaFormat for CurrentFormat {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::Current
    }

    fn name(&self) -> &'static str {
        "nvd-v2.0"
    }

    fn apply_query(&self, url: &mut Url, cursor: &HarvestCursor, config: &HarvestConfig) {
        let mut query = url.query_pairs_mut();
        query.append_pair("startIndex", &cursor.offset.to_string());
        query.append_pair("resultsPerPage", &cursor.page_size.to_string());
        if config.no_rejected {
            query.append_key_only("noRejected");
        }
        if let Some(keyword) = &config.keyword {
            query.append_pair("keywordSearch", keyword);
            if config.exact_match {
                query.append_key_only("keywordExactMatch");
            }
        }
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("Authorization", format!("Bearer {}", api_key))
    }

    fn decode_page(&self, body: &[u8]) -> Result<RawPage, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        Ok(RawPage {
            total_results: envelope.total_results,
            items: envelope.vulnerabilities.unwrap_or_default(),
        })
    }

    fn normalize(&self, item: &Value) -> Result<CanonicalRecord, NormalizeError> {
        let wrapper = Vulnerability::deserialize(item).map_err(|source| NormalizeError::Shape {
            schema: SchemaVersion::Current,
            source,
        })?;
        let cve = wrapper.cve;

        let published = parse_timestamp("published", cve.published.as_deref())?;
        let last_modified = parse_timestamp("lastModified", cve.last_modified.as_deref())?;

        let description = cve
            .descriptions
            .unwrap_or_default()
            .into_iter()
            .find(|d| d.lang.as_deref() == Some("en"))
            .and_then(|d| d.value)
            .unwrap_or_default();

        let references = cve
            .references
            .unwrap_or_default()
            .into_iter()
            .map(|r| Reference {
                url: r.url.unwrap_or_default(),
                tags: r.tags.unwrap_or_default(),
            })
            .collect();

        let cwe_ids = cve.weaknesses.and_then(|weaknesses| {
            let ids: Vec<String> = weaknesses
                .into_iter()
                .filter_map(|w| w.description?.into_iter().next()?.value)
                .collect();
            (!ids.is_empty()).then_some(ids)
        });

        let (cvss_v2, cvss_v3) = match cve.metrics {
            Some(metrics) => (
                first_score(metrics.cvss_metric_v2),
                first_score(metrics.cvss_metric_v31),
            ),
            None => (None, None),
        };

        Ok(CanonicalRecord {
            cve_id: cve.id.unwrap_or_default(),
            vuln_status: cve.vuln_status.unwrap_or_default(),
            published,
            last_modified,
            description,
            references,
            cwe_ids,
            affected_products: affected_products(cve.configurations.unwrap_or_default()),
            cvss_v2,
            cvss_v3,
        })
    }

    fn item_id(&self, item: &Value) -> Option<String> {
        item.pointer("/cve/id")?.as_str().map(str::to_string)
    }
}

fn first_score(metrics: Option<Vec<CvssMetric>>) -> Option<CvssScore> {
    let metric = metrics?.into_iter().next()?;
    let data = metric.cvss_data?;
    Some(CvssScore {
        base_score: data.base_score?,
        vector_string: data.vector_string.unwrap_or_default(),
        // v2 carries severity beside cvssData, v3.x inside it
        severity: metric.base_severity.or(data.base_severity),
    })
}

/// `vendor:product` pairs from every CPE 2.3 match criteria.
fn affected_products(configurations: Vec<Configuration>) -> Vec<String> {
    let mut products = BTreeSet::new();
    for node in configurations
        .into_iter()
        .flat_map(|c| c.nodes.unwrap_or_default())
    {
        for criteria in node
            .cpe_match
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.criteria)
        {
            // cpe:2.3:part:vendor:product:version:...
            let fields: Vec<&str> = criteria.split(':').collect();
            if fields.len() >= 5 {
                products.insert(format!("{}:{}", fields[3], fields[4]));
            }
        }
    }
    products.into_iter().collect()
}

// NVD API 2.0 payload structures
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    total_results: u64,
    vulnerabilities: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Vulnerability {
    cve: Cve,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cve {
    id: Option<String>,
    vuln_status: Option<String>,
    published: Option<String>,
    last_modified: Option<String>,
    descriptions: Option<Vec<LangString>>,
    metrics: Option<Metrics>,
    weaknesses: Option<Vec<Weakness>>,
    configurations: Option<Vec<Configuration>>,
    references: Option<Vec<RawReference>>,
}

#[derive(Debug, Deserialize)]
struct LangString {
    lang: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metrics {
    #[serde(rename = "cvssMetricV2")]
    cvss_metric_v2: Option<Vec<CvssMetric>>,
    #[serde(rename = "cvssMetricV31")]
    cvss_metric_v31: Option<Vec<CvssMetric>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssMetric {
    cvss_data: Option<CvssData>,
    base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssData {
    base_score: Option<f64>,
    vector_string: Option<String>,
    base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Weakness {
    description: Option<Vec<LangString>>,
}

#[derive(Debug, Deserialize)]
struct Configuration {
    nodes: Option<Vec<Node>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    cpe_match: Option<Vec<CpeMatch>>,
}

#[derive(Debug, Deserialize)]
struct CpeMatch {
    criteria: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    url: Option<String>,
    tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn minimal_item() -> Value {
        json!({
            "cve": {
                "id": "CVE-2024-1234",
                "published": "2024-02-01T10:15:09.143",
                "lastModified": "2024-02-03T08:00:00.000"
            }
        })
    }

    fn full_item() -> Value {
        json!({
            "cve": {
                "id": "CVE-2021-44228",
                "vulnStatus": "Analyzed",
                "published": "2021-12-10T10:15:09.143",
                "lastModified": "2023-11-07T03:39:36.747",
                "descriptions": [
                    {"lang": "es", "value": "Apache Log4j2 ..."},
                    {"lang": "en", "value": "Apache Log4j2 JNDI features ..."}
                ],
                "metrics": {
                    "cvssMetricV31": [{
                        "source": "nvd@nist.gov",
                        "cvssData": {
                            "version": "3.1",
                            "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:C/C:H/I:H/A:H",
                            "baseScore": 10.0,
                            "baseSeverity": "CRITICAL"
                        }
                    }],
                    "cvssMetricV2": [{
                        "cvssData": {
                            "version": "2.0",
                            "vectorString": "AV:N/AC:M/Au:N/C:C/I:C/A:C",
                            "baseScore": 9.3
                        },
                        "baseSeverity": "HIGH"
                    }]
                },
                "weaknesses": [
                    {"description": [{"lang": "en", "value": "CWE-917"}, {"lang": "en", "value": "CWE-502"}]},
                    {"description": [{"lang": "en", "value": "CWE-20"}]}
                ],
                "configurations": [{
                    "nodes": [{
                        "operator": "OR",
                        "cpeMatch": [
                            {"vulnerable": true, "criteria": "cpe:2.3:a:apache:log4j:*:*:*:*:*:*:*:*"},
                            {"vulnerable": true, "criteria": "cpe:2.3:a:apache:log4j:2.0:beta9:*:*:*:*:*:*"},
                            {"vulnerable": true, "criteria": "cpe:2.3:o:debian:debian_linux:10.0:*:*:*:*:*:*:*"},
                            {"vulnerable": true, "criteria": "cpe:2.3:a"}
                        ]
                    }]
                }],
                "references": [
                    {"url": "https://logging.apache.org/log4j/2.x/security.html", "tags": ["Vendor Advisory"]},
                    {"url": "https://github.com/apache/logging-log4j2/pull/608", "tags": ["Patch", "Third Party Advisory"]},
                    {"url": "http://www.openwall.com/lists/oss-security/2021/12/10/1"}
                ]
            }
        })
    }

    #[test]
    fn test_normalize_full_item() {
        let record = CurrentFormat.normalize(&full_item()).unwrap();

        assert_eq!(record.cve_id, "CVE-2021-44228");
        assert_eq!(record.vuln_status, "Analyzed");
        assert_eq!(record.description, "Apache Log4j2 JNDI features ...");
        assert_eq!(
            record.published,
            Utc.with_ymd_and_hms(2021, 12, 10, 10, 15, 9).unwrap()
                + chrono::Duration::milliseconds(143)
        );

        let v3 = record.cvss_v3.as_ref().unwrap();
        assert_eq!(v3.base_score, 10.0);
        assert_eq!(v3.severity.as_deref(), Some("CRITICAL"));

        let v2 = record.cvss_v2.as_ref().unwrap();
        assert_eq!(v2.base_score, 9.3);
        assert_eq!(v2.vector_string, "AV:N/AC:M/Au:N/C:C/I:C/A:C");
        assert_eq!(v2.severity.as_deref(), Some("HIGH"));

        assert_eq!(
            record.cwe_ids,
            Some(vec!["CWE-917".to_string(), "CWE-20".to_string()])
        );
        assert_eq!(
            record.affected_products,
            vec!["apache:log4j".to_string(), "debian:debian_linux".to_string()]
        );

        assert_eq!(record.references.len(), 3);
        assert!(record.references[2].tags.is_empty());
        assert_eq!(
            record.patch_links(),
            vec!["https://github.com/apache/logging-log4j2/pull/608"]
        );
    }

    #[test]
    fn test_v31_only_leaves_v2_absent() {
        let item = json!({
            "cve": {
                "id": "CVE-2024-0002",
                "published": "2024-01-01T00:00:00.000",
                "lastModified": "2024-01-01T00:00:00.000",
                "metrics": {
                    "cvssMetricV31": [{
                        "cvssData": {
                            "baseScore": 7.5,
                            "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:N/I:N/A:H",
                            "baseSeverity": "HIGH"
                        }
                    }]
                }
            }
        });

        let record = CurrentFormat.normalize(&item).unwrap();
        assert_eq!(record.cvss_v3.unwrap().base_score, 7.5);
        assert!(record.cvss_v2.is_none());
    }

    #[test]
    fn test_minimal_item_never_fails() {
        let record = CurrentFormat.normalize(&minimal_item()).unwrap();

        assert_eq!(record.cve_id, "CVE-2024-1234");
        assert_eq!(record.vuln_status, "");
        assert_eq!(record.description, "");
        assert!(record.references.is_empty());
        assert!(record.cwe_ids.is_none());
        assert!(record.affected_products.is_empty());
        assert!(record.cvss_v2.is_none());
        assert!(record.cvss_v3.is_none());
    }

    #[test]
    fn test_no_english_description() {
        let mut item = minimal_item();
        item["cve"]["descriptions"] = json!([{"lang": "fr", "value": "bonjour"}]);
        assert_eq!(CurrentFormat.normalize(&item).unwrap().description, "");
    }

    #[test]
    fn test_malformed_timestamp_is_item_error() {
        let mut item = minimal_item();
        item["cve"]["published"] = json!("10/12/2021");

        let err = CurrentFormat.normalize(&item).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MalformedTimestamp { field: "published", .. }
        ));
    }

    #[test]
    fn test_wrong_shape_is_item_error() {
        let err = CurrentFormat.normalize(&json!({"id": "CVE-1"})).unwrap_err();
        assert!(matches!(err, NormalizeError::Shape { .. }));
        let err = CurrentFormat.normalize(&json!("not an object")).unwrap_err();
        assert!(matches!(err, NormalizeError::Shape { .. }));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let item = full_item();
        assert_eq!(
            CurrentFormat.normalize(&item).unwrap(),
            CurrentFormat.normalize(&item).unwrap()
        );
    }

    #[test]
    fn test_decode_page() {
        let body = br#"{"resultsPerPage":2,"startIndex":0,"totalResults":3,
            "vulnerabilities":[{"cve":{"id":"A"}},{"cve":{"id":"B"}}]}"#;
        let page = CurrentFormat.decode_page(body).unwrap();
        assert_eq!(page.total_results, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(CurrentFormat.item_id(&page.items[1]).as_deref(), Some("B"));

        let empty = CurrentFormat.decode_page(br#"{"totalResults":0}"#).unwrap();
        assert!(empty.items.is_empty());

        assert!(CurrentFormat.decode_page(br#"{"vulnerabilities":[]}"#).is_err());
        assert!(CurrentFormat.decode_page(b"<html>").is_err());
    }

    #[test]
    fn test_query_parameters() {
        let config = HarvestConfig::default()
            .with_keyword("remote code", true)
            .with_no_rejected(true);
        let cursor = HarvestCursor {
            offset: 4000,
            page_size: 2000,
            total_known: None,
        };
        let mut url = Url::parse(config.base_url()).unwrap();
        CurrentFormat.apply_query(&mut url, &cursor, &config);

        assert_eq!(
            url.query(),
            Some("startIndex=4000&resultsPerPage=2000&noRejected&keywordSearch=remote+code&keywordExactMatch")
        );
    }

    #[test]
    fn test_query_without_filters() {
        let config = HarvestConfig::default();
        let mut url = Url::parse(config.base_url()).unwrap();
        CurrentFormat.apply_query(&mut url, &HarvestCursor::new(10), &config);
        assert_eq!(url.query(), Some("startIndex=0&resultsPerPage=10"));
    }
}
