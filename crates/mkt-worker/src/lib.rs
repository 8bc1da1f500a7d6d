//! Worker run orchestration: configuration, the fixed task list, post-ingest
//! hooks and the run summary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mkt_adapters::crypto::default_assets;
use mkt_adapters::{
    split_list, AdapterContext, AdapterError, AdapterReport, CryptoAdapter, EquityAdapter,
    EtfFlowAdapter, FilingSearchAdapter, MacroSeriesAdapter, SourceAdapter, SourceKind,
};
use mkt_core::{AlertKind, MarketStore, StoreError};
use mkt_storage::{HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT};
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod alert;
pub mod notify;

pub use alert::{AlertEvaluator, FlowAlert, DEFAULT_FLOW_ALERT_MUSD};
pub use notify::{notifier_for, NoopNotifier, Notifier, WebhookNotifier};

pub const CRATE_NAME: &str = "mkt-worker";

pub const DEFAULT_SEC_KEYWORDS: &str = "bitcoin OR digital asset";
pub const DEFAULT_SEC_FORMS: &str = "8-K,13F-HR";
pub const DEFAULT_WATCH_TICKERS: &str = "SPY,AAPL,QQQ";
pub const DEFAULT_FRED_SERIES: &str = "DGS10,DGS2,UNRATE,CPIAUCSL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub webhook_url: Option<String>,
    pub flow_alert_musd: f64,
    pub sec_keywords: String,
    pub sec_forms: Vec<String>,
    pub watch_tickers: Vec<String>,
    pub fred_series: Vec<String>,
    pub finnhub_key: Option<String>,
    pub fred_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        // Unlike `get`, a list variable set to "" means an empty list.
        let list = |key: &str, default: &str| match lookup(key) {
            Some(raw) => split_list(&raw),
            None => split_list(default),
        };

        let flow_alert_musd = match get("FLOW_ALERT_MUSD") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or(ConfigError::InvalidNumber {
                    var: "FLOW_ALERT_MUSD",
                    value: raw,
                })?,
            None => DEFAULT_FLOW_ALERT_MUSD,
        };
        let http_timeout_secs = match get("MKT_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or(ConfigError::InvalidNumber {
                    var: "MKT_HTTP_TIMEOUT_SECS",
                    value: raw,
                })?,
            None => 20,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            webhook_url: get("WEBHOOK_URL"),
            flow_alert_musd,
            sec_keywords: get("SEC_KEYWORDS").unwrap_or_else(|| DEFAULT_SEC_KEYWORDS.to_string()),
            sec_forms: list("SEC_FORMS", DEFAULT_SEC_FORMS),
            watch_tickers: list("WATCH_TICKERS", DEFAULT_WATCH_TICKERS)
                .into_iter()
                .map(|t| t.to_uppercase())
                .collect(),
            fred_series: list("FRED_SERIES", DEFAULT_FRED_SERIES),
            finnhub_key: get("FINNHUB_KEY"),
            fred_key: get("FRED_KEY"),
            user_agent: get("MKT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Runs after an adapter succeeds, inside the same task boundary.
#[async_trait]
pub trait PostIngestHook: Send + Sync {
    async fn apply(
        &self,
        ctx: &AdapterContext<'_>,
        report: &mut AdapterReport,
    ) -> Result<(), AdapterError>;
}

#[derive(Default)]
pub struct NoopHook;

#[async_trait]
impl PostIngestHook for NoopHook {
    async fn apply(&self, _ctx: &AdapterContext<'_>, _report: &mut AdapterReport) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Evaluates the net flow alert over the dates the flow adapter touched.
pub struct FlowAlertHook {
    evaluator: AlertEvaluator,
    notifier: Arc<dyn Notifier>,
}

impl FlowAlertHook {
    pub fn new(evaluator: AlertEvaluator, notifier: Arc<dyn Notifier>) -> Self {
        Self { evaluator, notifier }
    }
}

#[async_trait]
impl PostIngestHook for FlowAlertHook {
    async fn apply(&self, ctx: &AdapterContext<'_>, report: &mut AdapterReport) -> Result<(), AdapterError> {
        let fired = self
            .evaluator
            .evaluate(ctx.run_id, ctx.store, self.notifier.as_ref(), &report.flow_dates)
            .await?;
        if let Some(alert) = fired {
            report.note(format!("alert on {}: {:.1}M", alert.date, alert.net_musd));
        }
        Ok(())
    }
}

pub struct IngestTask {
    adapter: Box<dyn SourceAdapter>,
    hook: Box<dyn PostIngestHook>,
}

impl IngestTask {
    pub fn new(adapter: Box<dyn SourceAdapter>) -> Self {
        Self {
            adapter,
            hook: Box::<NoopHook>::default(),
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn PostIngestHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn name(&self) -> &'static str {
        self.adapter.source_id()
    }

    pub fn kind(&self) -> SourceKind {
        self.adapter.kind()
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let mut report = self.adapter.run(ctx).await?;
        self.hook.apply(ctx, &mut report).await?;
        Ok(report)
    }
}

/// The production task list, in run order.
pub fn standard_tasks(config: &WorkerConfig, notifier: Arc<dyn Notifier>) -> Vec<IngestTask> {
    vec![
        IngestTask::new(Box::new(CryptoAdapter::new(default_assets()))),
        IngestTask::new(Box::new(EquityAdapter::new(
            config.finnhub_key.clone(),
            config.watch_tickers.clone(),
        ))),
        IngestTask::new(Box::new(MacroSeriesAdapter::new(
            config.fred_key.clone(),
            config.fred_series.clone(),
        ))),
        IngestTask::new(Box::new(EtfFlowAdapter::new())).with_hook(Box::new(FlowAlertHook::new(
            AlertEvaluator::new(config.flow_alert_musd),
            notifier,
        ))),
        IngestTask::new(Box::new(FilingSearchAdapter::new(
            config.sec_keywords.clone(),
            config.sec_forms.clone(),
        ))),
    ]
}

/// `(ok, message)` for one task. Serialized as a two-element array.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task: &'static str,
    pub kind: SourceKind,
    pub ok: bool,
    pub message: String,
}

impl Serialize for TaskOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.ok)?;
        tup.serialize_element(&self.message)?;
        tup.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub ran_at: DateTime<Utc>,
    /// Wall-clock seconds for the whole run.
    pub duration: f64,
    pub results: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }
}

pub struct WorkerPipeline {
    store: Arc<dyn MarketStore>,
    http: HttpFetcher,
    tasks: Vec<IngestTask>,
}

impl WorkerPipeline {
    pub fn new(config: &WorkerConfig, store: Arc<dyn MarketStore>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let notifier: Arc<dyn Notifier> =
            Arc::from(notifier_for(config.webhook_url.as_deref(), &config.user_agent)?);
        Ok(Self::with_tasks(store, http, standard_tasks(config, notifier)))
    }

    pub fn with_tasks(store: Arc<dyn MarketStore>, http: HttpFetcher, tasks: Vec<IngestTask>) -> Self {
        Self { store, http, tasks }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(IngestTask::name).collect()
    }

    /// One full run. Only schema initialization can fail the run; task
    /// failures land in the summary and the summary write is best-effort.
    pub async fn run_once(&self) -> Result<RunSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let ran_at = Utc::now();
        let clock = Instant::now();

        self.store.init_schema().await?;
        info!(%run_id, tasks = self.tasks.len(), "schema ready; starting tasks");

        let ctx = AdapterContext {
            run_id,
            started_at: ran_at,
            http: &self.http,
            store: self.store.as_ref(),
        };

        let mut results = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let span = info_span!("task", task = task.name(), kind = ?task.kind(), %run_id);
            let outcome = async {
                match task.run(&ctx).await {
                    Ok(report) => {
                        info!(persisted = report.persisted, skipped = report.skipped, "task succeeded");
                        TaskOutcome {
                            task: task.name(),
                            kind: task.kind(),
                            ok: true,
                            message: report.detail(),
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "task failed");
                        TaskOutcome {
                            task: task.name(),
                            kind: task.kind(),
                            ok: false,
                            message: format!("{} error: {err}", task.name()),
                        }
                    }
                }
            }
            .instrument(span)
            .await;
            results.push(outcome);
        }

        let summary = RunSummary {
            run_id,
            ran_at,
            duration: clock.elapsed().as_secs_f64(),
            results,
        };
        self.log_summary(&summary).await;
        Ok(summary)
    }

    async fn log_summary(&self, summary: &RunSummary) {
        let payload = match serde_json::to_value(summary) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not encode run summary");
                return;
            }
        };
        if let Err(err) = self.store.append_alert(AlertKind::WorkerSummary, &payload).await {
            warn!(error = %err, "run summary not recorded");
        }
    }
}
