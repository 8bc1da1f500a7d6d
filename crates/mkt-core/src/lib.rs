//! Core record types and the store contract shared by the ingestion worker.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

pub const CRATE_NAME: &str = "mkt-core";

/// Single price observation. Sources that only report a trade price fill
/// open/high/low/close with the same value and volume with zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Fund-level daily net flow, in millions. `date` keeps the source formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowObservation {
    pub date: String,
    pub fund: String,
    pub flow_musd: f64,
}

/// Filing search hit. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingRecord {
    pub filed_at: Option<DateTime<Utc>>,
    pub form: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
}

impl FilingRecord {
    /// Natural key, or `None` when a component is NULL. Unique indexes treat
    /// NULLs as distinct, so such rows never conflict.
    pub fn natural_key(&self) -> Option<(DateTime<Utc>, &str, &str, &str)> {
        Some((
            self.filed_at?,
            self.form.as_deref()?,
            self.company.as_deref()?,
            self.title.as_deref()?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroObservation {
    pub series_id: String,
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Company headline. There is no natural key; the feed is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsRecord {
    pub source: String,
    pub symbol: String,
    pub ts: Option<DateTime<Utc>>,
    pub headline: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    EtfNetFlow,
    WorkerSummary,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::EtfNetFlow => "etf_net_flow",
            AlertKind::WorkerSummary => "worker_summary",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only alert log entry. `kind` stays a plain string on the read side
/// because the table may hold tags written by other tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: JsonValue,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema not initialised; call init_schema before writing")]
    SchemaNotReady,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract. Every write is one atomic statement keyed by the
/// record's natural key, so adapters can be re-run safely.
///
/// Conflict policy per record kind:
/// - price bars: update `close` only
/// - flows and macro observations: overwrite the value
/// - filings: first write wins
/// - news and alerts: append
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Create tables and indexes if absent.
    async fn init_schema(&self) -> StoreResult<()>;

    async fn upsert_price_bar(&self, symbol: &str, ts: DateTime<Utc>, price: f64) -> StoreResult<()>;

    async fn upsert_flow(&self, date: &str, fund: &str, flow_musd: f64) -> StoreResult<()>;

    async fn insert_filing(&self, filing: &FilingRecord) -> StoreResult<()>;

    async fn upsert_macro_observation(
        &self,
        series_id: &str,
        date: NaiveDate,
        value: Option<f64>,
    ) -> StoreResult<()>;

    async fn append_news(&self, item: &NewsRecord) -> StoreResult<()>;

    async fn append_alert(&self, kind: AlertKind, payload: &JsonValue) -> StoreResult<()>;

    /// Sum of every persisted flow for `date`, across all funds. Zero when
    /// nothing matches.
    async fn sum_flows_for_date(&self, date: &str) -> StoreResult<f64>;

    async fn latest_alert(&self) -> StoreResult<Option<AlertRecord>>;
}
