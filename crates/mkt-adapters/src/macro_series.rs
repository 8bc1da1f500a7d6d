//! FRED series observations.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{json_str, AdapterContext, AdapterError, AdapterReport, SourceAdapter, SourceKind};

pub const FRED_OBSERVATIONS_URL: &str = "https://api.stlouisfed.org/fred/series/observations";

/// Only the most recent observations are written on each run.
pub const OBSERVATION_WINDOW: usize = 240;

/// FRED publishes "." for a date with no value.
const MISSING_VALUE: &str = ".";

#[derive(Debug, Deserialize)]
struct ObservationsPage {
    #[serde(default)]
    observations: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedObservations {
    pub rows: Vec<(NaiveDate, Option<f64>)>,
    pub skipped: usize,
}

/// `"."`, `null`, a missing field or anything unreadable is stored as NULL.
fn observation_value(raw: Option<&JsonValue>) -> Option<f64> {
    let value = match raw? {
        JsonValue::String(text) if text.trim() == MISSING_VALUE => return None,
        JsonValue::String(text) => text.trim().parse::<f64>().ok()?,
        JsonValue::Number(n) => n.as_f64()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

pub fn parse_observations(body: &[u8]) -> Result<ParsedObservations, AdapterError> {
    let page: ObservationsPage = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Parse(format!("fred observations: {e}")))?;
    let start = page.observations.len().saturating_sub(OBSERVATION_WINDOW);
    let mut parsed = ParsedObservations {
        rows: Vec::new(),
        skipped: 0,
    };
    for obs in &page.observations[start..] {
        let date = json_str(obs, &["date"])
            .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok());
        let Some(date) = date else {
            parsed.skipped += 1;
            continue;
        };
        parsed.rows.push((date, observation_value(obs.get("value"))));
    }
    Ok(parsed)
}

#[derive(Debug, Clone)]
pub struct MacroSeriesAdapter {
    url: String,
    api_key: Option<String>,
    series: Vec<String>,
}

impl MacroSeriesAdapter {
    pub fn new(api_key: Option<String>, series: Vec<String>) -> Self {
        Self {
            url: FRED_OBSERVATIONS_URL.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            series,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl SourceAdapter for MacroSeriesAdapter {
    fn source_id(&self) -> &'static str {
        "macro"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(AdapterReport::skipped_with_note(self.source_id(), "skipped, no FRED_KEY"));
        };
        let mut report = AdapterReport::new(self.source_id());
        for series_id in &self.series {
            let resp = ctx
                .http
                .get(
                    ctx.run_id,
                    self.source_id(),
                    &self.url,
                    &[
                        ("series_id", series_id.clone()),
                        ("file_type", "json".to_string()),
                        ("api_key", key.to_string()),
                    ],
                )
                .await?;
            let parsed = parse_observations(&resp.body)?;
            for (date, value) in &parsed.rows {
                ctx.store
                    .upsert_macro_observation(series_id, *date, *value)
                    .await?;
            }
            debug!(series_id = %series_id, rows = parsed.rows.len(), "stored macro series");
            report.persisted += parsed.rows.len();
            report.skipped += parsed.skipped;
            report.note(format!("{series_id}={}", parsed.rows.len()));
        }
        Ok(report)
    }
}
