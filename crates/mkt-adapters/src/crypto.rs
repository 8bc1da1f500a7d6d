//! CoinGecko `market_chart` price series.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    datetime_from_epoch_millis, AdapterContext, AdapterError, AdapterReport, SourceAdapter,
    SourceKind,
};

pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// CoinGecko asset id paired with the short symbol stored on the bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAsset {
    pub asset_id: String,
    pub symbol: String,
}

impl CryptoAsset {
    pub fn new(asset_id: &str, symbol: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

pub fn default_assets() -> Vec<CryptoAsset> {
    vec![
        CryptoAsset::new("bitcoin", "BTC"),
        CryptoAsset::new("ethereum", "ETH"),
    ]
}

#[derive(Debug, Clone)]
pub struct CryptoAdapter {
    base_url: String,
    assets: Vec<CryptoAsset>,
    days: u32,
}

impl CryptoAdapter {
    pub fn new(assets: Vec<CryptoAsset>) -> Self {
        Self {
            base_url: COINGECKO_BASE_URL.to_string(),
            assets,
            days: 1,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for CryptoAdapter {
    fn default() -> Self {
        Self::new(default_assets())
    }
}

/// Parsed `prices` series plus the count of points that could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub points: Vec<(DateTime<Utc>, f64)>,
    pub malformed: usize,
}

/// Read `{"prices": [[epoch_ms, price], ...]}`. A missing `prices` key is an
/// empty series; a non-object body is a payload error.
pub fn parse_market_chart(payload: &JsonValue) -> Result<PriceSeries, AdapterError> {
    if !payload.is_object() {
        return Err(AdapterError::Parse("market_chart body is not an object".into()));
    }
    let mut series = PriceSeries {
        points: Vec::new(),
        malformed: 0,
    };
    let Some(prices) = payload.get("prices").and_then(JsonValue::as_array) else {
        return Ok(series);
    };
    for point in prices {
        let parsed = point.as_array().and_then(|pair| {
            let ts = datetime_from_epoch_millis(pair.first()?.as_f64()?)?;
            let price = pair.get(1)?.as_f64().filter(|p| p.is_finite())?;
            Some((ts, price))
        });
        match parsed {
            Some(p) => series.points.push(p),
            None => series.malformed += 1,
        }
    }
    Ok(series)
}

#[async_trait]
impl SourceAdapter for CryptoAdapter {
    fn source_id(&self) -> &'static str {
        "crypto"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let mut report = AdapterReport::new(self.source_id());
        for asset in &self.assets {
            let url = format!("{}/coins/{}/market_chart", self.base_url, asset.asset_id);
            let resp = ctx
                .http
                .get(
                    ctx.run_id,
                    self.source_id(),
                    &url,
                    &[("vs_currency", "usd".to_string()), ("days", self.days.to_string())],
                )
                .await?;
            let series = parse_market_chart(&resp.json::<JsonValue>()?)?;
            for (ts, price) in &series.points {
                ctx.store.upsert_price_bar(&asset.symbol, *ts, *price).await?;
            }
            debug!(
                symbol = %asset.symbol,
                points = series.points.len(),
                malformed = series.malformed,
                "stored crypto series"
            );
            report.persisted += series.points.len();
            report.skipped += series.malformed;
            report.note(format!("{}={}", asset.symbol, series.points.len()));
        }
        Ok(report)
    }
}
