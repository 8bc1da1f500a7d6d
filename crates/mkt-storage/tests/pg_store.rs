//! Postgres round-trips for `PgStore`. These need a disposable database:
//!
//! ```text
//! TEST_DATABASE_URL=postgres://... cargo test -p mkt-storage -- --ignored
//! ```

use chrono::{TimeZone, Utc};
use mkt_core::{AlertKind, FilingRecord, MarketStore};
use mkt_storage::PgStore;
use serde_json::json;

async fn store() -> PgStore {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let store = PgStore::connect(&url).await.expect("connect");
    store.init_schema().await.expect("schema");
    // second call must be a no-op
    store.init_schema().await.expect("schema twice");
    store
}

fn unique(tag: &str) -> String {
    format!("{tag}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore]
async fn price_bar_close_updates_and_open_freezes() {
    let s = store().await;
    let symbol = unique("TST");
    let ts = Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).single().unwrap();

    s.upsert_price_bar(&symbol, ts, 100.0).await.unwrap();
    s.upsert_price_bar(&symbol, ts, 101.5).await.unwrap();

    let (count, open, close): (i64, f64, f64) = sqlx::query_as(
        "SELECT COUNT(*), MIN(open), MIN(close) FROM market_bars WHERE symbol = $1",
    )
    .bind(&symbol)
    .fetch_one(s.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(open, 100.0);
    assert_eq!(close, 101.5);
}

#[tokio::test]
#[ignore]
async fn flow_overwrite_and_sum() {
    let s = store().await;
    let date = unique("2024-01-05");
    s.upsert_flow(&date, "ARKB", 10.0).await.unwrap();
    s.upsert_flow(&date, "ARKB", -5.0).await.unwrap();
    s.upsert_flow(&date, "IBIT", 505.0).await.unwrap();

    assert_eq!(s.sum_flows_for_date(&date).await.unwrap(), 500.0);
    assert_eq!(s.sum_flows_for_date(&unique("none")).await.unwrap(), 0.0);
}

#[tokio::test]
#[ignore]
async fn filing_first_write_wins() {
    let s = store().await;
    let title = unique("title");
    let mut filing = FilingRecord {
        filed_at: Some(Utc.with_ymd_and_hms(2024, 1, 5, 9, 30, 0).single().unwrap()),
        form: Some("8-K".into()),
        company: Some("Example Corp".into()),
        title: Some(title.clone()),
        link: Some("first".into()),
    };
    s.insert_filing(&filing).await.unwrap();
    filing.link = Some("second".into());
    s.insert_filing(&filing).await.unwrap();

    let links: Vec<Option<String>> = sqlx::query_scalar("SELECT link FROM sec_filings WHERE title = $1")
        .bind(&title)
        .fetch_all(s.pool())
        .await
        .unwrap();
    assert_eq!(links, vec![Some("first".to_string())]);
}

#[tokio::test]
#[ignore]
async fn latest_alert_reads_back_payload() {
    let s = store().await;
    let marker = unique("run");
    s.append_alert(AlertKind::WorkerSummary, &json!({"marker": marker}))
        .await
        .unwrap();
    let latest = s.latest_alert().await.unwrap().expect("alert row");
    assert_eq!(latest.kind, "worker_summary");
    assert_eq!(latest.payload["marker"], marker);
}
