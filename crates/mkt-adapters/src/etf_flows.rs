//! Farside bitcoin ETF flow table.
//!
//! The page is scraped, not an API, so parsing is an ordered chain of
//! strategies. Each strategy either yields flow rows or reports no match; an
//! exhausted chain is an empty result rather than a task failure.

use async_trait::async_trait;
use mkt_storage::FetchError;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use crate::{AdapterContext, AdapterError, AdapterReport, SourceAdapter, SourceKind};

pub const FARSIDE_BTC_URL: &str = "https://www.farside.co.uk/bitcoin-etf-flows";

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRow {
    pub fund: String,
    pub date: String,
    pub flow_musd: f64,
}

/// Rows extracted by one strategy, plus the rows it had to drop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFlows {
    pub strategy: &'static str,
    pub rows: Vec<FlowRow>,
    pub unparseable: usize,
}

type TableStrategy = fn(&str) -> Result<Option<ParsedFlows>, AdapterError>;

const STRATEGIES: &[(&str, TableStrategy)] = &[
    ("first_table", first_table),
    ("tabular_fallback", tabular_fallback),
];

/// Strip `$`, `m`/`M`, thousands separators and whitespace, then read a
/// signed float. `(12.0)` and the Unicode minus read as negatives.
pub fn parse_flow_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | 'm' | 'M' | ',') && !c.is_whitespace())
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .collect();

    let (negate, body) = match cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, cleaned.as_str()),
    };
    if body.is_empty() || body == "-" {
        return None;
    }
    let value = body.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(if negate { -value } else { value })
}

fn is_header_row(cells: &[String]) -> bool {
    cells
        .first()
        .map(|c| c.to_lowercase().contains("fund"))
        .unwrap_or(false)
}

/// Shared row rule: at least three cells, header rows skipped, the first
/// three cells read as (fund, date, flow).
fn rows_from_table(strategy: &'static str, table: &[Vec<String>]) -> ParsedFlows {
    let mut parsed = ParsedFlows {
        strategy,
        ..Default::default()
    };
    for cells in table {
        if cells.len() < 3 || is_header_row(cells) {
            continue;
        }
        match parse_flow_amount(&cells[2]) {
            Some(flow_musd) => parsed.rows.push(FlowRow {
                fund: cells[0].clone(),
                date: cells[1].clone(),
                flow_musd,
            }),
            None => parsed.unparseable += 1,
        }
    }
    parsed
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn dom_table_rows(table: ElementRef<'_>, row_sel: &Selector, cell_sel: &Selector) -> Vec<Vec<String>> {
    table
        .select(row_sel)
        .map(|row| row.select(cell_sel).map(element_text).collect::<Vec<_>>())
        .filter(|cells| !cells.is_empty())
        .collect()
}

fn non_empty(parsed: ParsedFlows) -> Option<ParsedFlows> {
    if parsed.rows.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

/// First `<table>` in the document, read with the row rule.
pub fn first_table(html: &str) -> Result<Option<ParsedFlows>, AdapterError> {
    let document = Html::parse_document(html);
    let (table_sel, row_sel, cell_sel) = (selector("table")?, selector("tr")?, selector("td, th")?);
    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };
    let rows = dom_table_rows(table, &row_sel, &cell_sel);
    Ok(non_empty(rows_from_table("first_table", &rows)))
}

/// Generic extraction over every table-shaped structure in the page. The
/// first candidate with at least three columns goes through the row rule.
pub fn tabular_fallback(html: &str) -> Result<Option<ParsedFlows>, AdapterError> {
    let document = Html::parse_document(html);
    let mut candidates: Vec<Vec<Vec<String>>> = Vec::new();

    let (table_sel, row_sel, cell_sel) = (selector("table")?, selector("tr")?, selector("td, th")?);
    for table in document.select(&table_sel) {
        candidates.push(dom_table_rows(table, &row_sel, &cell_sel));
    }

    let grid_sel = selector(r#"[role="table"], [role="grid"]"#)?;
    let aria_row_sel = selector(r#"[role="row"]"#)?;
    let aria_cell_sel = selector(
        r#"[role="cell"], [role="gridcell"], [role="columnheader"], [role="rowheader"]"#,
    )?;
    for grid in document.select(&grid_sel) {
        candidates.push(dom_table_rows(grid, &aria_row_sel, &aria_cell_sel));
    }

    // html5ever discards <tr> outside a table, so stray rows only survive in
    // the raw markup.
    candidates.push(stray_rows(html, &row_sel, &cell_sel));

    let Some(table) = candidates
        .iter()
        .find(|rows| rows.iter().map(Vec::len).max().unwrap_or(0) >= 3)
    else {
        return Ok(None);
    };
    Ok(non_empty(rows_from_table("tabular_fallback", table)))
}

/// Run the strategy chain in order; `None` when every strategy misses.
pub fn parse_flow_page(html: &str) -> Result<Option<ParsedFlows>, AdapterError> {
    for (name, strategy) in STRATEGIES {
        if let Some(parsed) = strategy(html)? {
            return Ok(Some(parsed));
        }
        debug!(strategy = name, "no flow rows");
    }
    Ok(None)
}

fn find_open_tag(lower: &str, name: &str, from: usize) -> Option<usize> {
    let needle = format!("<{name}");
    let mut pos = from;
    while let Some(idx) = lower.get(pos..)?.find(&needle) {
        let start = pos + idx;
        let after = lower.as_bytes().get(start + needle.len()).copied();
        match after {
            Some(b'>') | Some(b'/') => return Some(start),
            Some(c) if c.is_ascii_whitespace() => return Some(start),
            None => return None,
            _ => pos = start + needle.len(),
        }
    }
    None
}

/// Raw `<tr>` spans, each running to its closing tag or the next row.
fn stray_row_markup(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut spans = String::new();
    let mut pos = 0;
    while let Some(open) = find_open_tag(&lower, "tr", pos) {
        let after_open = open + "<tr".len();
        let next_open = find_open_tag(&lower, "tr", after_open);
        let close = lower[after_open..].find("</tr").map(|i| after_open + i);
        let end = match (close, next_open) {
            (Some(c), Some(n)) if n < c => n,
            (Some(c), _) => lower[c..].find('>').map(|i| c + i + 1).unwrap_or(lower.len()),
            (None, Some(n)) => n,
            (None, None) => lower.len(),
        };
        spans.push_str(&html[open..end]);
        pos = end;
    }
    spans
}

/// Re-parse stray rows inside a synthetic table so html5ever keeps them.
fn stray_rows(html: &str, row_sel: &Selector, cell_sel: &Selector) -> Vec<Vec<String>> {
    let spans = stray_row_markup(html);
    if spans.is_empty() {
        return Vec::new();
    }
    let fragment = Html::parse_fragment(&format!("<table>{spans}</table>"));
    dom_table_rows(fragment.root_element(), row_sel, cell_sel)
}

#[derive(Debug, Clone)]
pub struct EtfFlowAdapter {
    url: String,
}

impl EtfFlowAdapter {
    pub fn new() -> Self {
        Self {
            url: FARSIDE_BTC_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Default for EtfFlowAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for EtfFlowAdapter {
    fn source_id(&self) -> &'static str {
        "etf_flows"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicHtml
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<AdapterReport, AdapterError> {
        let resp = match ctx.http.get(ctx.run_id, self.source_id(), &self.url, &[]).await {
            Ok(resp) => resp,
            Err(FetchError::HttpStatus { status, .. }) => {
                info!(status, "flow page unavailable");
                return Ok(AdapterReport::skipped_with_note(
                    self.source_id(),
                    format!("page returned http {status}"),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        let html = resp.text();
        if html.trim().is_empty() {
            return Ok(AdapterReport::skipped_with_note(self.source_id(), "empty page"));
        }

        let Some(parsed) = parse_flow_page(&html)? else {
            info!("no flow table recognised");
            return Ok(AdapterReport::skipped_with_note(self.source_id(), "no flow table found"));
        };

        let mut report = AdapterReport::new(self.source_id());
        for row in &parsed.rows {
            ctx.store.upsert_flow(&row.date, &row.fund, row.flow_musd).await?;
            report.flow_dates.insert(row.date.clone());
        }
        report.persisted = parsed.rows.len();
        report.skipped = parsed.unparseable;
        report.note(format!("via {}", parsed.strategy));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, fixture, serve};
    use mkt_core::{MarketStore, MemoryStore};
    use mkt_storage::{HttpClientConfig, HttpFetcher};

    #[test]
    fn flow_amount_cleanup() {
        assert_eq!(parse_flow_amount("$1,234.5m"), Some(1234.5));
        assert_eq!(parse_flow_amount("-$12.0m"), Some(-12.0));
        assert_eq!(parse_flow_amount("(12.0)"), Some(-12.0));
        assert_eq!(parse_flow_amount("\u{2212}3.5"), Some(-3.5));
        assert_eq!(parse_flow_amount(" 0.0 M "), Some(0.0));
        assert_eq!(parse_flow_amount("n/a"), None);
        assert_eq!(parse_flow_amount("-"), None);
        assert_eq!(parse_flow_amount(""), None);
        assert_eq!(parse_flow_amount("nan"), None);
    }

    #[test]
    fn first_table_reads_rows_and_skips_header() {
        let parsed = first_table(&fixture("farside/flows_table.html")).unwrap().unwrap();
        assert_eq!(parsed.strategy, "first_table");
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(
            parsed.rows[0],
            FlowRow {
                fund: "IBIT".into(),
                date: "11 Jan 2024".into(),
                flow_musd: 111.7,
            }
        );
        assert_eq!(parsed.rows[1].flow_musd, -95.1);
        assert_eq!(parsed.rows[2].flow_musd, 1234.5);
        // "n/a" and "-" rows
        assert_eq!(parsed.unparseable, 2);
    }

    #[test]
    fn fallback_agrees_with_primary_on_a_plain_table() {
        let html = fixture("farside/flows_table.html");
        let primary = first_table(&html).unwrap().unwrap();
        let fallback = tabular_fallback(&html).unwrap().unwrap();
        assert_eq!(primary.rows, fallback.rows);
        assert_eq!(primary.unparseable, fallback.unparseable);
    }

    #[test]
    fn fallback_recovers_stray_rows_without_a_table() {
        let html = fixture("farside/flows_no_table.html");
        assert!(first_table(&html).unwrap().is_none());
        let parsed = parse_flow_page(&html).unwrap().unwrap();
        assert_eq!(parsed.strategy, "tabular_fallback");
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].fund, "FBTC");
        assert_eq!(parsed.rows[0].date, "12 Jan 2024");
        assert_eq!(parsed.rows[0].flow_musd, 227.0);
        assert_eq!(parsed.rows[1].fund, "GBTC & Co");
        assert_eq!(parsed.rows[1].flow_musd, -484.1);
    }

    #[test]
    fn fallback_reads_aria_grids() {
        let html = r#"<html><body>
            <div role="table">
              <div role="row"><span role="columnheader">Fund</span><span role="columnheader">Date</span><span role="columnheader">Flow</span></div>
              <div role="row"><span role="cell">ARKB</span><span role="cell">2024-01-15</span><span role="cell">$65.3m</span></div>
            </div>
        </body></html>"#;
        let parsed = parse_flow_page(html).unwrap().unwrap();
        assert_eq!(parsed.strategy, "tabular_fallback");
        assert_eq!(
            parsed.rows,
            vec![FlowRow {
                fund: "ARKB".into(),
                date: "2024-01-15".into(),
                flow_musd: 65.3,
            }]
        );
    }

    #[test]
    fn page_without_any_table_is_no_match() {
        let html = "<html><body><p>Site maintenance</p><track src=\"x\"></body></html>";
        assert!(parse_flow_page(html).unwrap().is_none());
    }

    #[test]
    fn stray_rows_decode_entities_like_the_primary_parser() {
        let rows = r#"<tr><th>Fund</th><th>Date</th><th>Flow</th></tr>
            <tr><td>GBTC</td><td>12 Jan 2024</td><td>&minus;$484.1m</td></tr>
            <tr><td>IBIT</td><td>12 Jan 2024</td><td>&#x24;10.0m</td></tr>"#;
        let in_table = format!("<html><body><table>{rows}</table></body></html>");
        let stray = format!("<html><body><div class=\"flows\">{rows}</div></body></html>");

        let primary = first_table(&in_table).unwrap().unwrap();
        assert!(first_table(&stray).unwrap().is_none());
        let recovered = parse_flow_page(&stray).unwrap().unwrap();

        assert_eq!(recovered.strategy, "tabular_fallback");
        assert_eq!(recovered.rows, primary.rows);
        assert_eq!(recovered.rows[0].flow_musd, -484.1);
        assert_eq!(recovered.rows[1].flow_musd, 10.0);
    }

    #[test]
    fn stray_markup_ignores_lookalike_tags() {
        let rows = stray_rows(
            "<track><tr><td>a</td><td>b &amp; c</td><td>&minus;1</td></tr>",
            &selector("tr").unwrap(),
            &selector("td, th").unwrap(),
        );
        assert_eq!(rows, vec![vec!["a".to_string(), "b & c".into(), "\u{2212}1".into()]]);
    }

    async fn run_against(status: u16, body: &str) -> (MemoryStore, AdapterReport) {
        let base = serve(&[("/flows", status, body)]).await;
        let store = MemoryStore::new();
        store.init_schema().await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = EtfFlowAdapter::new().with_url(format!("{base}/flows"));
        let report = adapter.run(&context(&http, &store)).await.unwrap();
        (store, report)
    }

    #[tokio::test]
    async fn served_table_is_stored_and_dates_reported() {
        let (store, report) = run_against(200, &fixture("farside/flows_table.html")).await;
        let mut flows: Vec<(String, f64)> = store
            .flows()
            .await
            .into_iter()
            .map(|f| (f.fund, f.flow_musd))
            .collect();
        flows.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            flows,
            vec![("FBTC".into(), -95.1), ("GBTC".into(), 1234.5), ("IBIT".into(), 111.7)]
        );
        assert_eq!(report.persisted, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(
            report.flow_dates.into_iter().collect::<Vec<_>>(),
            vec!["11 Jan 2024".to_string()]
        );
        let net = store.sum_flows_for_date("11 Jan 2024").await.unwrap();
        assert!((net - 1251.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn served_stray_rows_are_stored() {
        let (store, report) = run_against(200, &fixture("farside/flows_no_table.html")).await;
        assert_eq!(store.flows().await.len(), 2);
        assert!(report.flow_dates.contains("12 Jan 2024"));
        assert!(report.detail().contains("via tabular_fallback"));
    }

    #[tokio::test]
    async fn unavailable_page_is_an_empty_success() {
        let (store, report) = run_against(503, "maintenance").await;
        assert!(store.flows().await.is_empty());
        assert!(report.flow_dates.is_empty());
        assert!(report.detail().contains("page returned http 503"));
    }

    #[tokio::test]
    async fn empty_page_is_an_empty_success() {
        let (store, report) = run_against(200, "  \n").await;
        assert!(store.flows().await.is_empty());
        assert_eq!(report.persisted, 0);
        assert!(report.detail().contains("empty page"));
    }

    #[tokio::test]
    async fn page_without_flows_is_an_empty_success() {
        let (store, report) = run_against(200, "<html><body><p>No data today</p></body></html>").await;
        assert!(store.flows().await.is_empty());
        assert!(report.detail().contains("no flow table found"));
    }
}
