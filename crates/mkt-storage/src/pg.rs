//! [`PgStore`], the Postgres implementation of [`MarketStore`].
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so building
//! does not need a live database. Each statement checks a connection out of
//! the pool and returns it when the statement completes, on success or error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mkt_core::{AlertKind, AlertRecord, FilingRecord, MarketStore, NewsRecord, StoreError, StoreResult};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use crate::schema::SCHEMA;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MarketStore for PgStore {
    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn upsert_price_bar(&self, symbol: &str, ts: DateTime<Utc>, price: f64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO market_bars (symbol, ts, open, high, low, close, volume)
            VALUES ($1, $2, $3, $3, $3, $3, 0)
            ON CONFLICT (symbol, ts) DO UPDATE SET close = EXCLUDED.close
            "#,
        )
        .bind(symbol)
        .bind(ts)
        .bind(price)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn upsert_flow(&self, date: &str, fund: &str, flow_musd: f64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO etf_flows (date, fund, flow_musd)
            VALUES ($1, $2, $3)
            ON CONFLICT (date, fund) DO UPDATE SET flow_musd = EXCLUDED.flow_musd
            "#,
        )
        .bind(date)
        .bind(fund)
        .bind(flow_musd)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn insert_filing(&self, filing: &FilingRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sec_filings (filed_at, form, company, title, link)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (filed_at, form, company, title) DO NOTHING
            "#,
        )
        .bind(filing.filed_at)
        .bind(filing.form.as_deref())
        .bind(filing.company.as_deref())
        .bind(filing.title.as_deref())
        .bind(filing.link.as_deref())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn upsert_macro_observation(
        &self,
        series_id: &str,
        date: NaiveDate,
        value: Option<f64>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO macro_observations (series_id, date, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (series_id, date) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(series_id)
        .bind(date)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn append_news(&self, item: &NewsRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO news_items (source, symbol, ts, headline, link)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&item.source)
        .bind(&item.symbol)
        .bind(item.ts)
        .bind(item.headline.as_deref())
        .bind(item.link.as_deref())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn append_alert(&self, kind: AlertKind, payload: &JsonValue) -> StoreResult<()> {
        sqlx::query("INSERT INTO alerts (kind, payload) VALUES ($1, $2)")
            .bind(kind.as_str())
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn sum_flows_for_date(&self, date: &str) -> StoreResult<f64> {
        sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(flow_musd), 0)::DOUBLE PRECISION FROM etf_flows WHERE date = $1",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn latest_alert(&self) -> StoreResult<Option<AlertRecord>> {
        let row = sqlx::query_as::<_, (i64, DateTime<Utc>, String, Option<JsonValue>)>(
            r#"
            SELECT id, ts, kind, payload
              FROM alerts
             ORDER BY ts DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(|(id, ts, kind, payload)| AlertRecord {
            id,
            ts,
            kind,
            payload: payload.unwrap_or(JsonValue::Null),
        }))
    }
}
