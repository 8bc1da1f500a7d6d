//! Postgres persistence + outbound HTTP utilities for the ingestion worker.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

mod pg;
mod schema;

pub use pg::PgStore;
pub use schema::SCHEMA;

pub const CRATE_NAME: &str = "mkt-storage";

pub const DEFAULT_USER_AGENT: &str = "MarketAI/1.0 (market-ingest-worker)";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

/// Single-attempt HTTP client. There is no retry or backoff: a failed call is
/// reported to the caller and the next scheduled run is the retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: strip_query(&self.final_url).to_string(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` with query parameters. Query values are kept out of the
    /// tracing span since some sources take credentials as parameters.
    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "GET");
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(reqwest::Error::without_url)?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "POST");
        async {
            let resp = self
                .client
                .post(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(body)
                .send()
                .await
                .map_err(reqwest::Error::without_url)?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }
}

async fn read_success(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        tracing::debug!(status = status.as_u16(), "non-success response");
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: strip_query(&final_url).to_string(),
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(reqwest::Error::without_url)?
        .to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
