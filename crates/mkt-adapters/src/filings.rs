//! SEC EDGAR full-text filing search.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mkt_core::FilingRecord;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_str, text_or_none, AdapterContext, AdapterError, AdapterReport, SourceAdapter, SourceKind};

pub const SEC_SEARCH_URL: &str = "https://efts.sec.gov/LATEST/search-index";
pub const SEC_VIEWER_URL: &str = "https://www.sec.gov/ixviewer/doc?action=display&source=content&doc=";

/// Fixed result window; paging is not followed.
pub const RESULT_WINDOW: u32 = 40;

#[derive(Debug, Clone)]
pub struct FilingSearchAdapter {
    url: String,
    keywords: String,
    forms: Vec<String>,
}

impl FilingSearchAdapter {
    pub fn new(keywords: impl Into<String>, forms: Vec<String>) -> Self {
        Self {
            url: SEC_SEARCH_URL.to_string(),
            keywords: keywords.into(),
            forms,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn request_body(&self) -> JsonValue {
        json!({
            "keys": build_query(&self.keywords, &self.forms),
            "category": "custom",
            "from": 0,
            "size": RESULT_WINDOW,
            "sort": [{"filedAt": {"order": "desc"}}],
        })
    }
}

/// `(keywords) AND (formType:"A" OR formType:"B")`; the form clause is
/// dropped when no forms are configured.
pub fn build_query(keywords: &str, forms: &[String]) -> String {
    let form_clause = forms
        .iter()
        .map(|f| format!("formType:\"{f}\""))
        .collect::<Vec<_>>()
        .join(" OR ");
    if form_clause.is_empty() {
        format!("({keywords})")
    } else {
        format!("({keywords}) AND ({form_clause})")
    }
}

/// Accepts RFC 3339, a bare `YYYY-MM-DDTHH:MM:SS` (read as UTC) or a bare
/// date (midnight UTC). Anything else is stored as NULL.
pub fn parse_filed_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn filing_from_hit(hit: &JsonValue) -> FilingRecord {
    let source = hit.get("_source").unwrap_or(&JsonValue::Null);

    let company = source
        .get("displayNames")
        .and_then(JsonValue::as_array)
        .and_then(|names| names.first())
        .and_then(JsonValue::as_str)
        .or_else(|| json_str(source, &["companyName"]))
        .and_then(text_or_none);
    let title = json_str(source, &["displayTitle"])
        .and_then(text_or_none)
        .or_else(|| json_str(source, &["documentDescription"]).and_then(text_or_none));

    FilingRecord {
        filed_at: json_str(source, &["filedAt"]).and_then(parse_filed_at),
        form: json_str(source, &["formType"]).and_then(text_or_none),
        company,
        title,
        link: json_str(source, &["link"])
            .and_then(text_or_none)
            .map(|doc| format!("{SEC_VIEWER_URL}{doc}")),
    }
}

pub fn parse_search_response(payload: &JsonValue) -> Vec<FilingRecord> {
    payload
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(JsonValue::as_array)
        .map(|hits| hits.iter().map(filing_from_hit).collect())
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for FilingSearchAdapter {
    fn source_id(&self) -> &'static str {
        "sec_filings"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SearchApi
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let resp = ctx
            .http
            .post_json(ctx.run_id, self.source_id(), &self.url, &self.request_body())
            .await?;
        let filings = parse_search_response(&resp.json::<JsonValue>()?);
        for filing in &filings {
            ctx.store.insert_filing(filing).await?;
        }
        let undated = filings.iter().filter(|f| f.filed_at.is_none()).count();
        debug!(hits = filings.len(), undated, "stored filing hits");

        let mut report = AdapterReport::new(self.source_id());
        report.persisted = filings.len();
        if undated > 0 {
            report.note(format!("{undated} without filing date"));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn query_with_and_without_forms() {
        let forms = vec!["8-K".to_string(), "13F-HR".to_string()];
        assert_eq!(
            build_query("bitcoin OR digital asset", &forms),
            r#"(bitcoin OR digital asset) AND (formType:"8-K" OR formType:"13F-HR")"#
        );
        assert_eq!(build_query("bitcoin", &[]), "(bitcoin)");
    }

    #[test]
    fn request_body_has_fixed_window_and_sort() {
        let body = FilingSearchAdapter::new("bitcoin", vec!["8-K".into()]).request_body();
        assert_eq!(body["category"], "custom");
        assert_eq!(body["from"], 0);
        assert_eq!(body["size"], 40);
        assert_eq!(body["sort"][0]["filedAt"]["order"], "desc");
        assert_eq!(body["keys"], r#"(bitcoin) AND (formType:"8-K")"#);
    }

    #[test]
    fn filed_at_formats() {
        assert_eq!(
            parse_filed_at("2024-01-05T16:30:12-05:00").unwrap().to_rfc3339(),
            "2024-01-05T21:30:12+00:00"
        );
        assert_eq!(
            parse_filed_at("2024-01-05T16:30:12").unwrap().to_rfc3339(),
            "2024-01-05T16:30:12+00:00"
        );
        assert_eq!(
            parse_filed_at("2024-01-05").unwrap().to_rfc3339(),
            "2024-01-05T00:00:00+00:00"
        );
        assert!(parse_filed_at("last tuesday").is_none());
    }

    #[test]
    fn hits_map_to_filings() {
        let payload: JsonValue = serde_json::from_str(&fixture("sec/search_index.json")).unwrap();
        let filings = parse_search_response(&payload);
        assert_eq!(filings.len(), 3);

        let first = &filings[0];
        assert_eq!(first.form.as_deref(), Some("8-K"));
        assert_eq!(first.company.as_deref(), Some("MicroStrategy Inc (MSTR)"));
        assert_eq!(first.title.as_deref(), Some("Current report"));
        assert_eq!(
            first.link.as_deref(),
            Some("https://www.sec.gov/ixviewer/doc?action=display&source=content&doc=/Archives/edgar/data/1050446/0001193125-24-002951.htm")
        );
        assert!(first.natural_key().is_some());

        let second = &filings[1];
        assert_eq!(second.company.as_deref(), Some("Example Asset Management LLC"));
        assert_eq!(second.title.as_deref(), Some("Quarterly holdings report"));
        assert!(second.link.is_none());

        let third = &filings[2];
        assert!(third.filed_at.is_none());
        assert!(third.natural_key().is_none());
    }

    #[test]
    fn missing_hits_is_empty() {
        assert!(parse_search_response(&serde_json::json!({"took": 3})).is_empty());
    }
}
