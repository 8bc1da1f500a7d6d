//! Finnhub intraday candles, quote fallback and company news.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mkt_core::NewsRecord;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    datetime_from_epoch_secs, json_f64, json_str, text_or_none, AdapterContext, AdapterError,
    AdapterReport, SourceAdapter, SourceKind,
};

pub const FINNHUB_BASE_URL: &str = "https://finnhub.io/api/v1";

const CANDLE_RESOLUTION: &str = "5";
const CANDLE_LOOKBACK_DAYS: i64 = 2;
const NEWS_LOOKBACK_DAYS: i64 = 3;
const NEWS_PER_TICKER: usize = 10;

#[derive(Debug, Clone)]
pub struct EquityAdapter {
    base_url: String,
    api_key: Option<String>,
    tickers: Vec<String>,
}

impl EquityAdapter {
    pub fn new(api_key: Option<String>, tickers: Vec<String>) -> Self {
        Self {
            base_url: FINNHUB_BASE_URL.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            tickers,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn ingest_ticker(
        &self,
        ctx: &AdapterContext<'_>,
        key: &str,
        ticker: &str,
        report: &mut AdapterReport,
    ) -> Result<(), AdapterError> {
        let now = ctx.started_at;
        let candle_query = [
            ("symbol", ticker.to_string()),
            ("resolution", CANDLE_RESOLUTION.to_string()),
            ("from", (now - Duration::days(CANDLE_LOOKBACK_DAYS)).timestamp().to_string()),
            ("to", now.timestamp().to_string()),
            ("token", key.to_string()),
        ];
        let candles = match ctx
            .http
            .get(ctx.run_id, self.source_id(), &format!("{}/stock/candle", self.base_url), &candle_query)
            .await
        {
            Ok(resp) => resp
                .json::<JsonValue>()
                .map(|v| parse_candles(&v))
                .unwrap_or_default(),
            Err(err) => {
                debug!(ticker, error = %err, "candle fetch failed; trying quote");
                Vec::new()
            }
        };

        let points = if candles.is_empty() {
            let resp = ctx
                .http
                .get(
                    ctx.run_id,
                    self.source_id(),
                    &format!("{}/quote", self.base_url),
                    &[("symbol", ticker.to_string()), ("token", key.to_string())],
                )
                .await?;
            parse_quote(&resp.json::<JsonValue>()?, now).into_iter().collect()
        } else {
            candles
        };
        for (ts, price) in &points {
            ctx.store.upsert_price_bar(ticker, *ts, *price).await?;
        }
        report.persisted += points.len();

        // News is a separate sub-feed; losing it never fails the ticker.
        match self.ingest_news(ctx, key, ticker).await {
            Ok(stored) => {
                report.persisted += stored;
                report.note(format!("{ticker}: {} prices, {stored} news", points.len()));
            }
            Err(err) => {
                warn!(ticker, error = %err, "company news unavailable");
                report.skipped += 1;
                report.note(format!("{ticker}: {} prices, news failed: {err}", points.len()));
            }
        }
        Ok(())
    }

    async fn ingest_news(
        &self,
        ctx: &AdapterContext<'_>,
        key: &str,
        ticker: &str,
    ) -> Result<usize, AdapterError> {
        let now = ctx.started_at;
        let news_query = [
            ("symbol", ticker.to_string()),
            ("from", (now - Duration::days(NEWS_LOOKBACK_DAYS)).format("%Y-%m-%d").to_string()),
            ("to", now.format("%Y-%m-%d").to_string()),
            ("token", key.to_string()),
        ];
        let resp = ctx
            .http
            .get(ctx.run_id, self.source_id(), &format!("{}/company-news", self.base_url), &news_query)
            .await?;
        let news = parse_news(&resp.json::<JsonValue>()?, ticker);
        for item in &news {
            ctx.store.append_news(item).await?;
        }
        Ok(news.len())
    }
}

/// `{"s": "ok", "t": [...], "c": [...]}`. Any other status, or mismatched
/// arrays, yields no points.
pub fn parse_candles(payload: &JsonValue) -> Vec<(DateTime<Utc>, f64)> {
    if json_str(payload, &["s"]) != Some("ok") {
        return Vec::new();
    }
    let (Some(times), Some(closes)) = (
        payload.get("t").and_then(JsonValue::as_array),
        payload.get("c").and_then(JsonValue::as_array),
    ) else {
        return Vec::new();
    };
    times
        .iter()
        .zip(closes)
        .filter_map(|(t, c)| {
            let ts = datetime_from_epoch_secs(t.as_i64()?)?;
            let close = c.as_f64().filter(|v| v.is_finite())?;
            Some((ts, close))
        })
        .collect()
}

/// Current price from `/quote`. Finnhub answers unknown symbols with zeros.
pub fn parse_quote(payload: &JsonValue, fallback_ts: DateTime<Utc>) -> Option<(DateTime<Utc>, f64)> {
    let price = json_f64(payload, &["c"]).filter(|c| c.is_finite() && *c > 0.0)?;
    let ts = payload
        .get("t")
        .and_then(JsonValue::as_i64)
        .and_then(datetime_from_epoch_secs)
        .unwrap_or(fallback_ts);
    Some((ts, price))
}

pub fn parse_news(payload: &JsonValue, ticker: &str) -> Vec<NewsRecord> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .take(NEWS_PER_TICKER)
        .map(|item| NewsRecord {
            source: "finnhub".to_string(),
            symbol: ticker.to_string(),
            ts: item
                .get("datetime")
                .and_then(JsonValue::as_i64)
                .and_then(datetime_from_epoch_secs),
            headline: json_str(item, &["headline"]).and_then(text_or_none),
            link: json_str(item, &["url"]).and_then(text_or_none),
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for EquityAdapter {
    fn source_id(&self) -> &'static str {
        "equity"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(AdapterReport::skipped_with_note(self.source_id(), "skipped, no FINNHUB_KEY"));
        };
        let mut report = AdapterReport::new(self.source_id());
        let mut last_error = None;
        let mut failed = 0usize;
        for ticker in &self.tickers {
            if let Err(err) = self.ingest_ticker(ctx, key, ticker, &mut report).await {
                warn!(ticker = %ticker, error = %err, "ticker ingest failed");
                report.note(format!("{ticker} failed: {err}"));
                failed += 1;
                last_error = Some(err);
            }
        }
        report.skipped += failed;
        match last_error {
            Some(err) if failed == self.tickers.len() => Err(err),
            _ => Ok(report),
        }
    }
}
