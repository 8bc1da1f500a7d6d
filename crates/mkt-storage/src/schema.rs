//! Postgres DDL for the worker tables.

/// Full schema; idempotent thanks to `IF NOT EXISTS`. The unique indexes are
/// the conflict targets of the upserts in [`crate::PgStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS market_bars (
    id      BIGSERIAL PRIMARY KEY,
    symbol  TEXT NOT NULL,
    ts      TIMESTAMPTZ NOT NULL,
    open    DOUBLE PRECISION,
    high    DOUBLE PRECISION,
    low     DOUBLE PRECISION,
    close   DOUBLE PRECISION,
    volume  DOUBLE PRECISION
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_bars_symbol_ts ON market_bars (symbol, ts);

CREATE TABLE IF NOT EXISTS etf_flows (
    id         BIGSERIAL PRIMARY KEY,
    date       TEXT NOT NULL,   -- source-formatted calendar day
    fund       TEXT NOT NULL,
    flow_musd  DOUBLE PRECISION NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_etf_date_fund ON etf_flows (date, fund);

-- Filings are immutable once observed. NULL key components never conflict.
CREATE TABLE IF NOT EXISTS sec_filings (
    id        BIGSERIAL PRIMARY KEY,
    filed_at  TIMESTAMPTZ,
    form      TEXT,
    company   TEXT,
    title     TEXT,
    link      TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sec_unique ON sec_filings (filed_at, form, company, title);

CREATE TABLE IF NOT EXISTS macro_observations (
    id         BIGSERIAL PRIMARY KEY,
    series_id  TEXT NOT NULL,
    date       DATE NOT NULL,
    value      DOUBLE PRECISION
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_macro_series_date ON macro_observations (series_id, date);

-- No natural key; append-only.
CREATE TABLE IF NOT EXISTS news_items (
    id          BIGSERIAL PRIMARY KEY,
    source      TEXT NOT NULL,
    symbol      TEXT NOT NULL,
    ts          TIMESTAMPTZ,
    headline    TEXT,
    link        TEXT,
    fetched_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_news_symbol_ts ON news_items (symbol, ts);

-- Append-only; never updated or deleted by the worker.
CREATE TABLE IF NOT EXISTS alerts (
    id       BIGSERIAL PRIMARY KEY,
    ts       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    kind     TEXT NOT NULL,
    payload  JSONB
);
CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts (ts);
"#;
