//! In-process [`MarketStore`] with the same conflict rules as the Postgres
//! schema. Backs the test suites and the CLI dry-run mode.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    AlertKind, AlertRecord, FilingRecord, FlowObservation, MacroObservation, MarketStore,
    NewsRecord, PriceBar, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct Tables {
    schema_ready: bool,
    bars: BTreeMap<(String, DateTime<Utc>), PriceBar>,
    flows: BTreeMap<(String, String), FlowObservation>,
    filings: Vec<FilingRecord>,
    macro_observations: BTreeMap<(String, NaiveDate), MacroObservation>,
    news: Vec<NewsRecord>,
    alerts: Vec<AlertRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn price_bars(&self) -> Vec<PriceBar> {
        self.tables.lock().await.bars.values().cloned().collect()
    }

    pub async fn flows(&self) -> Vec<FlowObservation> {
        self.tables.lock().await.flows.values().cloned().collect()
    }

    pub async fn filings(&self) -> Vec<FilingRecord> {
        self.tables.lock().await.filings.clone()
    }

    pub async fn macro_observations(&self) -> Vec<MacroObservation> {
        self.tables
            .lock()
            .await
            .macro_observations
            .values()
            .cloned()
            .collect()
    }

    pub async fn news(&self) -> Vec<NewsRecord> {
        self.tables.lock().await.news.clone()
    }

    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.tables.lock().await.alerts.clone()
    }
}

fn ready(tables: &Tables) -> StoreResult<()> {
    if tables.schema_ready {
        Ok(())
    } else {
        Err(StoreError::SchemaNotReady)
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn init_schema(&self) -> StoreResult<()> {
        self.tables.lock().await.schema_ready = true;
        Ok(())
    }

    async fn upsert_price_bar(&self, symbol: &str, ts: DateTime<Utc>, price: f64) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        tables
            .bars
            .entry((symbol.to_string(), ts))
            .and_modify(|bar| bar.close = price)
            .or_insert_with(|| PriceBar {
                symbol: symbol.to_string(),
                ts,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            });
        Ok(())
    }

    async fn upsert_flow(&self, date: &str, fund: &str, flow_musd: f64) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        tables.flows.insert(
            (date.to_string(), fund.to_string()),
            FlowObservation {
                date: date.to_string(),
                fund: fund.to_string(),
                flow_musd,
            },
        );
        Ok(())
    }

    async fn insert_filing(&self, filing: &FilingRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        if let Some(key) = filing.natural_key() {
            if tables.filings.iter().any(|f| f.natural_key() == Some(key)) {
                return Ok(());
            }
        }
        tables.filings.push(filing.clone());
        Ok(())
    }

    async fn upsert_macro_observation(
        &self,
        series_id: &str,
        date: NaiveDate,
        value: Option<f64>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        tables.macro_observations.insert(
            (series_id.to_string(), date),
            MacroObservation {
                series_id: series_id.to_string(),
                date,
                value,
            },
        );
        Ok(())
    }

    async fn append_news(&self, item: &NewsRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        tables.news.push(item.clone());
        Ok(())
    }

    async fn append_alert(&self, kind: AlertKind, payload: &JsonValue) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        ready(&tables)?;
        let id = tables.alerts.len() as i64 + 1;
        tables.alerts.push(AlertRecord {
            id,
            ts: Utc::now(),
            kind: kind.as_str().to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn sum_flows_for_date(&self, date: &str) -> StoreResult<f64> {
        let tables = self.tables.lock().await;
        ready(&tables)?;
        Ok(tables
            .flows
            .values()
            .filter(|f| f.date == date)
            .map(|f| f.flow_musd)
            .sum())
    }

    async fn latest_alert(&self) -> StoreResult<Option<AlertRecord>> {
        let tables = self.tables.lock().await;
        ready(&tables)?;
        Ok(tables.alerts.last().cloned())
    }
}
