//! Net ETF flow threshold alert.

use chrono::NaiveDate;
use mkt_core::{AlertKind, MarketStore, StoreError};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::notify::Notifier;

pub const DEFAULT_FLOW_ALERT_MUSD: f64 = 500.0;

const FLOW_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d %b %Y", "%d %B %Y", "%m/%d/%Y"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowAlert {
    pub date: String,
    pub net_musd: f64,
}

impl FlowAlert {
    pub fn message(&self) -> String {
        format!("BTC ETF net flow on {}: ${:.1}M", self.date, self.net_musd)
    }
}

fn parse_flow_date(raw: &str) -> Option<NaiveDate> {
    FLOW_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

/// Calendar-latest date when every date is readable, otherwise the
/// lexicographic maximum.
pub fn latest_flow_date<'a, I>(dates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    let dates: Vec<&'a str> = dates.into_iter().map(String::as_str).collect();
    let parsed: Option<Vec<(NaiveDate, &'a str)>> = dates
        .iter()
        .map(|d| parse_flow_date(d).map(|nd| (nd, *d)))
        .collect();
    match parsed {
        Some(parsed) => parsed.into_iter().max().map(|(_, d)| d),
        None => dates.into_iter().max(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertEvaluator {
    threshold_musd: f64,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_ALERT_MUSD)
    }
}

impl AlertEvaluator {
    pub fn new(threshold_musd: f64) -> Self {
        Self { threshold_musd }
    }

    pub fn threshold_musd(&self) -> f64 {
        self.threshold_musd
    }

    pub fn crosses(&self, net_musd: f64) -> bool {
        net_musd.abs() >= self.threshold_musd
    }

    /// Sum every stored flow for the latest date observed this run. When the
    /// sum crosses the threshold an `etf_net_flow` record is appended and the
    /// notifier is called. No suppression across runs.
    pub async fn evaluate<'a, I>(
        &self,
        run_id: Uuid,
        store: &dyn MarketStore,
        notifier: &dyn Notifier,
        observed_dates: I,
    ) -> Result<Option<FlowAlert>, StoreError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(date) = latest_flow_date(observed_dates) else {
            return Ok(None);
        };
        let net_musd = store.sum_flows_for_date(date).await?;
        if !self.crosses(net_musd) {
            debug!(date, net_musd, threshold = self.threshold_musd, "net flow below threshold");
            return Ok(None);
        }

        let alert = FlowAlert {
            date: date.to_string(),
            net_musd,
        };
        store
            .append_alert(
                AlertKind::EtfNetFlow,
                &json!({ "date": alert.date, "net_musd": alert.net_musd }),
            )
            .await?;
        info!(date, net_musd, "net flow alert raised");
        notifier.notify(run_id, &alert.message()).await;
        Ok(Some(alert))
    }
}
