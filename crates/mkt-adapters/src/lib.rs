//! Source adapter contract + the five market data adapters.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mkt_core::{MarketStore, StoreError};
use mkt_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod crypto;
pub mod equity;
pub mod etf_flows;
pub mod filings;
pub mod macro_series;

pub use crypto::CryptoAdapter;
pub use equity::EquityAdapter;
pub use etf_flows::EtfFlowAdapter;
pub use filings::FilingSearchAdapter;
pub use macro_series::MacroSeriesAdapter;

pub const CRATE_NAME: &str = "mkt-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    PublicHtml,
    Api,
    SearchApi,
}

/// Everything an adapter may touch during one run. Adapters hold no state of
/// their own between runs.
#[derive(Clone, Copy)]
pub struct AdapterContext<'a> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub http: &'a HttpFetcher,
    pub store: &'a dyn MarketStore,
}

/// Outcome of one adapter run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdapterReport {
    pub source_id: String,
    pub persisted: usize,
    pub skipped: usize,
    pub notes: Vec<String>,
    /// Calendar days touched by flow observations in this run.
    pub flow_dates: BTreeSet<String>,
}

impl AdapterReport {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    pub fn skipped_with_note(source_id: &str, note: impl Into<String>) -> Self {
        let mut report = Self::new(source_id);
        report.notes.push(note.into());
        report
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// One-line message for the run summary.
    pub fn detail(&self) -> String {
        let mut out = format!(
            "{} ok: {} persisted, {} skipped",
            self.source_id, self.persisted, self.skipped
        );
        if !self.notes.is_empty() {
            out.push_str(" (");
            out.push_str(&self.notes.join("; "));
            out.push(')');
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected payload: {0}")]
    Parse(String),
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;

    /// Fetch, parse, validate and persist. Row-level problems are counted in
    /// the report; only source-level problems come back as errors.
    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError>;
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn datetime_from_epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

fn datetime_from_epoch_millis(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() || millis <= 0.0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

/// Split a comma-separated setting, trimming blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(text_or_none)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use chrono::Utc;
    use mkt_core::MarketStore;
    use mkt_storage::HttpFetcher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use uuid::Uuid;

    use crate::AdapterContext;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(rel: &str) -> String {
        let path = workspace_root().join("fixtures").join(rel);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("reading fixture {}: {e}", path.display()))
    }

    pub fn context<'a>(http: &'a HttpFetcher, store: &'a dyn MarketStore) -> AdapterContext<'a> {
        AdapterContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            http,
            store,
        }
    }

    type Routes = HashMap<String, (u16, String)>;

    /// Loopback HTTP server answering each request path (query ignored) with a
    /// canned status and body. Unlisted paths get a 404. Returns the base URL.
    pub async fn serve(routes: &[(&str, u16, &str)]) -> String {
        let routes: Arc<Routes> = Arc::new(
            routes
                .iter()
                .map(|(path, status, body)| (path.to_string(), (*status, body.to_string())))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("loopback address");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let _ = respond(stream, &routes).await;
                });
            }
        });
        format!("http://{addr}")
    }

    async fn respond(mut stream: TcpStream, routes: &Routes) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_len = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
        let body_len = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        // Drain the request body so closing the socket does not reset it.
        while buf.len() < head_len + body_len {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let target = head.split_whitespace().nth(1).unwrap_or("/");
        let path = target.split('?').next().unwrap_or(target);
        let (status, body) = routes.get(path).cloned().unwrap_or((404, String::new()));
        let response = format!(
            "HTTP/1.1 {status} {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            if status < 400 { "OK" } else { "Error" },
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" SPY, aapl ,,QQQ "), vec!["SPY", "aapl", "QQQ"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn json_path_helpers() {
        let v = json!({"a": {"b": "x", "n": 1.5}});
        assert_eq!(json_str(&v, &["a", "b"]), Some("x"));
        assert_eq!(json_f64(&v, &["a", "n"]), Some(1.5));
        assert_eq!(json_str(&v, &["a", "missing"]), None);
    }

    #[test]
    fn epoch_conversions_reject_non_positive() {
        assert!(datetime_from_epoch_secs(0).is_none());
        assert!(datetime_from_epoch_millis(-1.0).is_none());
        assert!(datetime_from_epoch_millis(f64::NAN).is_none());
        let ts = datetime_from_epoch_millis(1_704_412_800_000.0).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-05T00:00:00+00:00");
    }

    #[test]
    fn report_detail_mentions_counts_and_notes() {
        let mut report = AdapterReport::new("crypto");
        report.persisted = 3;
        report.skipped = 1;
        report.note("BTC=2");
        assert_eq!(report.detail(), "crypto ok: 3 persisted, 1 skipped (BTC=2)");
    }
}
