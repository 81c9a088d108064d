//! NVD CVE API 1.0 (retired JSON 1.1 feed shape).

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

use super::parse_timestamp;
use crate::config::HarvestConfig;
use crate::harvest::traits::{NormalizeError, SchemaFormat};
use crate::model::{CanonicalRecord, CvssScore, HarvestCursor, RawPage, Reference, SchemaVersion};

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyFormat;

impl SchemaFormat for LegacyFormat {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::Legacy
    }

    fn name(&self) -> &'static str {
        "nvd-v1.0"
    }

    fn apply_query(&self, url: &mut Url, cursor: &HarvestCursor, config: &HarvestConfig) {
        let mut query = url.query_pairs_mut();
        query.append_pair("startIndex", &cursor.offset.to_string());
        query.append_pair("resultsPerPage", &cursor.page_size.to_string());
        if let Some(keyword) = &config.keyword {
            query.append_pair("keyword", keyword);
            if config.exact_match {
                query.append_pair("isExactMatch", "true");
            }
        }
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("apiKey", api_key.to_string())
    }

    fn decode_page(&self, body: &[u8]) -> Result<RawPage, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        Ok(RawPage {
            total_results: envelope.total_results,
            items: envelope
                .result
                .and_then(|r| r.cve_items)
                .unwrap_or_default(),
        })
    }

    fn normalize(&self, item: &Value) -> Result<CanonicalRecord, NormalizeError> {
        let item = CveItem::deserialize(item).map_err(|source| NormalizeError::Shape {
            schema: SchemaVersion::Legacy,
            source,
        })?;

        let published = parse_timestamp("publishedDate", item.published_date.as_deref())?;
        let last_modified =
            parse_timestamp("lastModifiedDate", item.last_modified_date.as_deref())?;

        let cve = item.cve;

        let description = cve
            .description
            .and_then(|d| d.description_data)
            .unwrap_or_default()
            .into_iter()
            .find(|d| d.lang.as_deref() == Some("en"))
            .and_then(|d| d.value)
            .unwrap_or_default();

        let references = cve
            .references
            .and_then(|r| r.reference_data)
            .unwrap_or_default()
            .into_iter()
            .map(|r| Reference {
                url: r.url.unwrap_or_default(),
                tags: r.tags.unwrap_or_default(),
            })
            .collect();

        let cwe_ids = cve
            .problemtype
            .and_then(|p| p.problemtype_data)
            .and_then(|entries| {
                let ids: Vec<String> = entries
                    .into_iter()
                    .filter_map(|e| e.description?.into_iter().next()?.value)
                    .collect();
                (!ids.is_empty()).then_some(ids)
            });

        let (cvss_v2, cvss_v3) = match item.impact {
            Some(impact) => (
                impact.base_metric_v2.and_then(|m| {
                    let data = m.cvss_v2?;
                    score(data, m.severity)
                }),
                impact.base_metric_v3.and_then(|m| {
                    let data = m.cvss_v3?;
                    let severity = data.base_severity.clone();
                    score(data, severity)
                }),
            ),
            None => (None, None),
        };

        let affected_products = item
            .configurations
            .and_then(|c| c.nodes)
            .map(|nodes| operator_matches(&nodes))
            .unwrap_or_default();

        Ok(CanonicalRecord {
            cve_id: cve.meta.and_then(|m| m.id).unwrap_or_default(),
            vuln_status: String::new(),
            published,
            last_modified,
            description,
            references,
            cwe_ids,
            affected_products,
            cvss_v2,
            cvss_v3,
        })
    }

    fn item_id(&self, item: &Value) -> Option<String> {
        item.pointer("/cve/CVE_data_meta/ID")?
            .as_str()
            .map(str::to_string)
    }
}

fn score(data: CvssData, severity: Option<String>) -> Option<CvssScore> {
    Some(CvssScore {
        base_score: data.base_score?,
        vector_string: data.vector_string.unwrap_or_default(),
        severity,
    })
}

/// `"<operator> <cpe23Uri>"` for the first match of every node, children included.
fn operator_matches(nodes: &[Node]) -> Vec<String> {
    let mut products = BTreeSet::new();
    let mut pending: Vec<&Node> = nodes.iter().collect();

    while let Some(node) = pending.pop() {
        if let Some(uri) = node
            .cpe_match
            .as_deref()
            .and_then(|matches| matches.first())
            .and_then(|m| m.cpe23_uri.as_deref())
        {
            let operator = node.operator.as_deref().unwrap_or("OR");
            products.insert(format!("{} {}", operator, uri));
        }
        if let Some(children) = &node.children {
            pending.extend(children.iter());
        }
    }

    products.into_iter().collect()
}

// NVD API 1.0 payload structures
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    total_results: u64,
    result: Option<ResultBlock>,
}

#[derive(Debug, Deserialize)]
struct ResultBlock {
    #[serde(rename = "CVE_Items")]
    cve_items: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CveItem {
    cve: CveBody,
    configurations: Option<Configurations>,
    impact: Option<Impact>,
    published_date: Option<String>,
    last_modified_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CveBody {
    #[serde(rename = "CVE_data_meta")]
    meta: Option<DataMeta>,
    problemtype: Option<ProblemType>,
    references: Option<References>,
    description: Option<Description>,
}

#[derive(Debug, Deserialize)]
struct DataMeta {
    #[serde(rename = "ID")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProblemType {
    problemtype_data: Option<Vec<ProblemTypeEntry>>,
}

#[derive(Debug, Deserialize)]
struct ProblemTypeEntry {
    description: Option<Vec<LangString>>,
}

#[derive(Debug, Deserialize)]
struct References {
    reference_data: Option<Vec<RawReference>>,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    url: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Description {
    description_data: Option<Vec<LangString>>,
}

#[derive(Debug, Deserialize)]
struct LangString {
    lang: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Configurations {
    nodes: Option<Vec<Node>>,
}

#[derive(Debug, Deserialize)]
struct Node {
    operator: Option<String>,
    children: Option<Vec<Node>>,
    cpe_match: Option<Vec<CpeMatch>>,
}

#[derive(Debug, Deserialize)]
struct CpeMatch {
    #[serde(rename = "cpe23Uri")]
    cpe23_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Impact {
    base_metric_v3: Option<BaseMetricV3>,
    base_metric_v2: Option<BaseMetricV2>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseMetricV3 {
    cvss_v3: Option<CvssData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseMetricV2 {
    cvss_v2: Option<CvssData>,
    severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssData {
    base_score: Option<f64>,
    vector_string: Option<String>,
    base_severity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn legacy_item() -> Value {
        json!({
            "cve": {
                "data_type": "CVE",
                "CVE_data_meta": {"ID": "CVE-2019-0708", "ASSIGNER": "secure@microsoft.com"},
                "problemtype": {"problemtype_data": [
                    {"description": [{"lang": "en", "value": "CWE-416"}]}
                ]},
                "references": {"reference_data": [
                    {"url": "http://packetstormsecurity.com/files/153133", "name": "x", "refsource": "MISC", "tags": ["Exploit"]},
                    {"url": "https://portal.msrc.microsoft.com/CVE-2019-0708", "refsource": "CONFIRM"}
                ]},
                "description": {"description_data": [
                    {"lang": "en", "value": "A remote code execution vulnerability exists in Remote Desktop Services"}
                ]}
            },
            "configurations": {
                "CVE_data_version": "4.0",
                "nodes": [
                    {"operator": "OR", "children": [], "cpe_match": [
                        {"vulnerable": true, "cpe23Uri": "cpe:2.3:o:microsoft:windows_7:-:sp1:*:*:*:*:*:*"},
                        {"vulnerable": true, "cpe23Uri": "cpe:2.3:o:microsoft:windows_xp:-:sp3:*:*:*:*:*:*"}
                    ]},
                    {"operator": "AND", "children": [
                        {"operator": "OR", "children": [], "cpe_match": [
                            {"vulnerable": true, "cpe23Uri": "cpe:2.3:o:siemens:axiom_multix_m_firmware:-:*:*:*:*:*:*:*"}
                        ]}
                    ], "cpe_match": []}
                ]
            },
            "impact": {
                "baseMetricV3": {"cvssV3": {
                    "version": "3.0",
                    "vectorString": "CVSS:3.0/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H",
                    "baseScore": 9.8,
                    "baseSeverity": "CRITICAL"
                }},
                "baseMetricV2": {
                    "cvssV2": {"version": "2.0", "vectorString": "AV:N/AC:L/Au:N/C:C/I:C/A:C", "baseScore": 10.0},
                    "severity": "HIGH"
                }
            },
            "publishedDate": "2019-05-16T19:29Z",
            "lastModifiedDate": "2021-06-03T18:15Z"
        })
    }

    #[test]
    fn test_normalize_legacy_item() {
        let record = LegacyFormat.normalize(&legacy_item()).unwrap();

        assert_eq!(record.cve_id, "CVE-2019-0708");
        assert_eq!(record.vuln_status, "");
        assert_eq!(
            record.published,
            Utc.with_ymd_and_hms(2019, 5, 16, 19, 29, 0).unwrap()
        );
        assert!(record.description.starts_with("A remote code execution"));
        assert_eq!(record.cwe_ids, Some(vec!["CWE-416".to_string()]));

        assert_eq!(record.references.len(), 2);
        assert_eq!(record.references[0].tags, vec!["Exploit".to_string()]);
        assert!(record.references[1].tags.is_empty());

        let v3 = record.cvss_v3.unwrap();
        assert_eq!(v3.base_score, 9.8);
        assert_eq!(v3.severity.as_deref(), Some("CRITICAL"));
        let v2 = record.cvss_v2.unwrap();
        assert_eq!(v2.base_score, 10.0);
        assert_eq!(v2.severity.as_deref(), Some("HIGH"));
    }

    #[test]
    fn test_affected_products_use_operator_and_first_match() {
        let record = LegacyFormat.normalize(&legacy_item()).unwrap();
        assert_eq!(
            record.affected_products,
            vec![
                "OR cpe:2.3:o:microsoft:windows_7:-:sp1:*:*:*:*:*:*".to_string(),
                "OR cpe:2.3:o:siemens:axiom_multix_m_firmware:-:*:*:*:*:*:*:*".to_string(),
            ]
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let item = legacy_item();
        let first = LegacyFormat.normalize(&item).unwrap();
        assert_eq!(first, LegacyFormat.normalize(&item).unwrap());
        assert_eq!(first, LegacyFormat.normalize(&item.clone()).unwrap());
    }

    #[test]
    fn test_minimal_legacy_item() {
        let item = json!({
            "cve": {"CVE_data_meta": {"ID": "CVE-2000-0001"}},
            "publishedDate": "2000-01-01T05:00Z",
            "lastModifiedDate": "2000-01-01T05:00Z"
        });
        let record = LegacyFormat.normalize(&item).unwrap();

        assert_eq!(record.cve_id, "CVE-2000-0001");
        assert_eq!(record.description, "");
        assert!(record.cwe_ids.is_none());
        assert!(record.affected_products.is_empty());
        assert!(record.cvss_v2.is_none());
        assert!(record.cvss_v3.is_none());
    }

    #[test]
    fn test_empty_problemtype_is_absent() {
        let mut item = legacy_item();
        item["cve"]["problemtype"] = json!({"problemtype_data": [{"description": []}]});
        assert!(LegacyFormat.normalize(&item).unwrap().cwe_ids.is_none());
    }

    #[test]
    fn test_missing_published_date() {
        let mut item = legacy_item();
        item.as_object_mut().unwrap().remove("publishedDate");
        assert!(matches!(
            LegacyFormat.normalize(&item),
            Err(NormalizeError::MissingField("publishedDate"))
        ));
    }

    #[test]
    fn test_current_shape_is_rejected() {
        let item = json!({"cve": {"id": "CVE-2024-1", "published": "2024-01-01T00:00:00"}});
        assert!(LegacyFormat.normalize(&item).is_err());
    }

    #[test]
    fn test_decode_legacy_page() {
        let body = br#"{"resultsPerPage":1,"startIndex":0,"totalResults":250,
            "result":{"CVE_data_type":"CVE","CVE_Items":[{"cve":{"CVE_data_meta":{"ID":"CVE-1"}}}]}}"#;
        let page = LegacyFormat.decode_page(body).unwrap();
        assert_eq!(page.total_results, 250);
        assert_eq!(LegacyFormat.item_id(&page.items[0]).as_deref(), Some("CVE-1"));
    }

    #[test]
    fn test_legacy_query_parameters() {
        let config = HarvestConfig::new(SchemaVersion::Legacy)
            .with_keyword("rdp", true)
            .with_no_rejected(true);
        let mut url = Url::parse(config.base_url()).unwrap();
        LegacyFormat.apply_query(&mut url, &HarvestCursor::new(200), &config);

        assert_eq!(
            url.as_str(),
            "https://services.nvd.nist.gov/rest/json/cves/1.0/?startIndex=0&resultsPerPage=200&keyword=rdp&isExactMatch=true"
        );
    }
}
