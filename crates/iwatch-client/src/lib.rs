//! Catalog source client: structured API first, HTML scrape fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iwatch_core::ProgramRecord;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "iwatch-client";

/// Every jurisdiction code the upstream catalog partitions by.
pub const SCOPE_UNIVERSE: [&str; 56] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC", "PR", "VI", "GU", "AS", "MP",
];

/// Scopes the client-side search fallback fans out to when no scope filter
/// is given. Unbounded fan-out over the full universe would take minutes.
const SEARCH_FALLBACK_SCOPES: usize = 5;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_base: String,
    pub timeout: Duration,
    pub rate_limit: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://programs.dsireusa.org".to_string(),
            api_base: "https://programs.dsireusa.org/api/v1".to_string(),
            timeout: Duration::from_secs(30),
            rate_limit: Duration::from_secs(1),
            user_agent: "incentive-watch/0.1 (incentive research)".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparseable response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub api_available: bool,
    pub site_available: bool,
    pub api_status: Option<u16>,
    pub site_status: Option<u16>,
    pub errors: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub query: Option<String>,
    pub scope: Option<String>,
    pub program_type: Option<String>,
    pub technology: Option<String>,
    pub sector: Option<String>,
}

/// Shared HTTP transport. One instance per client; the rate limiter lives
/// here so both strategies pace against the same clock.
#[derive(Debug)]
struct Transport {
    http: reqwest::Client,
    config: ClientConfig,
    last_request: Mutex<Option<Instant>>,
}

impl Transport {
    fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            config,
            last_request: Mutex::new(None),
        })
    }

    /// Sleep long enough to honor the minimum inter-request interval. The
    /// lock is held across the sleep so concurrent callers queue up instead
    /// of stampeding the upstream.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.rate_limit {
                tokio::time::sleep(self.config.rate_limit - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        self.pace().await;
        let mut request = self.http.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(response.text().await?)
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<JsonValue, FetchError> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One way of getting catalog entries. The client tries strategies in a
/// fixed order: structured API, then HTML scrape.
#[async_trait]
trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn listing(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError>;

    async fn detail(&self, external_id: &str) -> Result<ProgramRecord, FetchError>;
}

struct ApiStrategy {
    transport: Arc<Transport>,
}

#[async_trait]
impl FetchStrategy for ApiStrategy {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn listing(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError> {
        let url = format!("{}/programs", self.transport.config.api_base);
        let value = self.transport.get_json(&url, &[("state", scope)]).await?;
        Ok(normalize_api_listing(&value, Some(scope), Utc::now()))
    }

    async fn detail(&self, external_id: &str) -> Result<ProgramRecord, FetchError> {
        let url = format!("{}/programs/{}", self.transport.config.api_base, external_id);
        let value = self.transport.get_json(&url, &[]).await?;
        ProgramRecord::from_api_value(&value, None, Utc::now()).ok_or_else(|| FetchError::Parse {
            url,
            reason: "detail payload has no identifier".to_string(),
        })
    }
}

struct ScrapeStrategy {
    transport: Arc<Transport>,
}

#[async_trait]
impl FetchStrategy for ScrapeStrategy {
    fn name(&self) -> &'static str {
        "scrape"
    }

    async fn listing(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError> {
        let url = format!(
            "{}/system/program/{}",
            self.transport.config.base_url,
            scope.to_ascii_lowercase()
        );
        let body = self.transport.get_text(&url, &[]).await?;
        Ok(parse_listing_html(
            &body,
            &self.transport.config.base_url,
            scope,
            Utc::now(),
        ))
    }

    async fn detail(&self, external_id: &str) -> Result<ProgramRecord, FetchError> {
        let url = format!(
            "{}/system/program/detail/{}",
            self.transport.config.base_url, external_id
        );
        let body = self.transport.get_text(&url, &[]).await?;
        Ok(parse_detail_html(&body, external_id, &url, Utc::now()))
    }
}

/// Seam consumed by the scan runner. Lets tests substitute a stub source.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_by_scope(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError>;

    async fn fetch_details(&self, external_id: &str)
        -> Result<Option<ProgramRecord>, FetchError>;
}

/// Catalog client hiding whether data came from the API or a scrape.
pub struct CatalogClient {
    transport: Arc<Transport>,
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl CatalogClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(Transport::new(config)?);
        let strategies: Vec<Box<dyn FetchStrategy>> = vec![
            Box::new(ApiStrategy {
                transport: Arc::clone(&transport),
            }),
            Box::new(ScrapeStrategy {
                transport: Arc::clone(&transport),
            }),
        ];
        Ok(Self {
            transport,
            strategies,
        })
    }

    /// List catalog entries for one scope. Strategies are tried in order;
    /// a strategy that answers (even with an empty list) wins. Total failure
    /// yields an empty list, never an error.
    pub async fn list_scope(&self, scope: &str) -> Vec<ProgramRecord> {
        let scope = scope.to_ascii_uppercase();
        for strategy in &self.strategies {
            match strategy.listing(&scope).await {
                Ok(records) => {
                    info!(
                        scope = %scope,
                        strategy = strategy.name(),
                        count = records.len(),
                        "listing fetched"
                    );
                    return records;
                }
                Err(err) => {
                    warn!(scope = %scope, strategy = strategy.name(), %err, "listing failed");
                }
            }
        }
        Vec::new()
    }

    /// Enrich one record with full attributes. `None` on total failure.
    pub async fn detail(&self, external_id: &str) -> Option<ProgramRecord> {
        for strategy in &self.strategies {
            match strategy.detail(external_id).await {
                Ok(record) => return Some(record),
                Err(err) => {
                    warn!(external_id, strategy = strategy.name(), %err, "detail fetch failed");
                }
            }
        }
        None
    }

    /// Search with filters. Falls back to fetching a scope listing and
    /// filtering client-side when the search endpoint is unavailable; with
    /// no scope filter the fallback is bounded to a few scopes.
    pub async fn search(&self, filters: &SearchFilters) -> Vec<ProgramRecord> {
        let url = format!("{}/programs/search", self.transport.config.api_base);
        let mut query: Vec<(&str, &str)> = Vec::new();
        let scope_upper = filters.scope.as_deref().map(str::to_ascii_uppercase);
        if let Some(q) = filters.query.as_deref() {
            query.push(("q", q));
        }
        if let Some(scope) = scope_upper.as_deref() {
            query.push(("state", scope));
        }
        if let Some(pt) = filters.program_type.as_deref() {
            query.push(("type", pt));
        }
        if let Some(tech) = filters.technology.as_deref() {
            query.push(("technology", tech));
        }
        if let Some(sector) = filters.sector.as_deref() {
            query.push(("sector", sector));
        }

        match self.transport.get_json(&url, &query).await {
            Ok(value) => return normalize_api_listing(&value, scope_upper.as_deref(), Utc::now()),
            Err(err) => {
                warn!(%err, "search endpoint failed, filtering listings client-side");
            }
        }

        let mut records = Vec::new();
        match scope_upper.as_deref() {
            Some(scope) => records.extend(self.list_scope(scope).await),
            None => {
                debug!(
                    scopes = SEARCH_FALLBACK_SCOPES,
                    "no scope filter, bounding fallback fan-out"
                );
                for scope in SCOPE_UNIVERSE.iter().take(SEARCH_FALLBACK_SCOPES) {
                    records.extend(self.list_scope(scope).await);
                }
            }
        }

        if let Some(query) = filters.query.as_deref() {
            let needle = query.to_ascii_lowercase();
            records.retain(|r| {
                serde_json::to_string(&r.attribute_map())
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .contains(&needle)
            });
        }
        records
    }

    /// Federal-level entries: the API `level` filter plus the federal
    /// listing page, deduplicated by external id.
    pub async fn fetch_federal(&self) -> Vec<ProgramRecord> {
        let mut records = Vec::new();
        let url = format!("{}/programs", self.transport.config.api_base);
        match self.transport.get_json(&url, &[("level", "federal")]).await {
            Ok(value) => records.extend(normalize_api_listing(&value, None, Utc::now())),
            Err(err) => warn!(%err, "federal api listing failed"),
        }

        let page_url = format!("{}/system/program/federal", self.transport.config.base_url);
        match self.transport.get_text(&page_url, &[]).await {
            Ok(body) => {
                for record in
                    parse_listing_html(&body, &self.transport.config.base_url, "US", Utc::now())
                {
                    if !records.iter().any(|r: &ProgramRecord| {
                        r.external_id == record.external_id
                    }) {
                        records.push(record);
                    }
                }
            }
            Err(err) => warn!(%err, "federal page scrape failed"),
        }
        records
    }

    /// Lightweight health check of both strategies. Operator-facing only.
    pub async fn check_status(&self) -> SourceStatus {
        let mut status = SourceStatus {
            api_available: false,
            site_available: false,
            api_status: None,
            site_status: None,
            errors: Vec::new(),
            checked_at: Utc::now(),
        };

        let api_url = format!("{}/programs", self.transport.config.api_base);
        match self.transport.get_text(&api_url, &[("state", "NY")]).await {
            Ok(_) => {
                status.api_available = true;
                status.api_status = Some(200);
            }
            Err(FetchError::HttpStatus { status: code, .. }) => {
                status.api_status = Some(code);
                status.errors.push(format!("api returned status {code}"));
            }
            Err(err) => status.errors.push(format!("api error: {err}")),
        }

        let site_url = format!("{}/system/program/ny", self.transport.config.base_url);
        match self.transport.get_text(&site_url, &[]).await {
            Ok(_) => {
                status.site_available = true;
                status.site_status = Some(200);
            }
            Err(FetchError::HttpStatus { status: code, .. }) => {
                status.site_status = Some(code);
                status.errors.push(format!("site returned status {code}"));
            }
            Err(err) => status.errors.push(format!("site error: {err}")),
        }

        status
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_by_scope(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError> {
        Ok(self.list_scope(scope).await)
    }

    async fn fetch_details(
        &self,
        external_id: &str,
    ) -> Result<Option<ProgramRecord>, FetchError> {
        Ok(self.detail(external_id).await)
    }
}

/// Accept the shapes the listing endpoint is known to serve: a bare array,
/// or an object wrapping one under `programs` or `data`.
fn normalize_api_listing(
    value: &JsonValue,
    fallback_scope: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Vec<ProgramRecord> {
    let items = match value {
        JsonValue::Array(items) => items.as_slice(),
        JsonValue::Object(map) => map
            .get("programs")
            .or_else(|| map.get("data"))
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    items
        .iter()
        .filter_map(|item| ProgramRecord::from_api_value(item, fallback_scope, fetched_at))
        .collect()
}

fn selector(css: &str) -> Selector {
    // All selectors in this module are literals; a parse failure is a bug.
    Selector::parse(css).unwrap_or_else(|_| panic!("invalid selector: {css}"))
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<String>();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract (id, name, detail link) triples from a scope listing page.
fn parse_listing_html(
    html: &str,
    base_url: &str,
    scope: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<ProgramRecord> {
    let document = Html::parse_document(html);
    let links = selector(r#"a[href*="/system/program/detail/"]"#);
    let mut records = Vec::new();

    for link in document.select(&links) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}/{}", base_url.trim_end_matches('/'), href.trim_start_matches('/'))
        };
        let Some(external_id) = url.rsplit('/').next().filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(name) = element_text(link) else {
            continue;
        };

        let mut record = ProgramRecord::new(external_id, fetched_at);
        record.name = Some(name);
        record.scope = Some(scope.to_ascii_uppercase());
        record.url = Some(url);
        records.push(record);
    }

    records
}

/// Parse a detail page's label/value rows into named attributes.
fn parse_detail_html(
    html: &str,
    external_id: &str,
    url: &str,
    fetched_at: DateTime<Utc>,
) -> ProgramRecord {
    let document = Html::parse_document(html);
    let mut record = ProgramRecord::new(external_id, fetched_at);
    record.url = Some(url.to_string());

    let title = selector("h1, .program-title, .title");
    if let Some(el) = document.select(&title).next() {
        record.name = element_text(el);
    }

    let rows = selector("tr, dl, .program-detail");
    let label_sel = selector("th, dt, .label, strong");
    let value_sel = selector("td, dd, .value");
    for row in document.select(&rows) {
        let Some(label_el) = row.select(&label_sel).next() else {
            continue;
        };
        let Some(value_el) = row.select(&value_sel).next() else {
            continue;
        };
        let Some(label) = element_text(label_el) else {
            continue;
        };
        let Some(value) = element_text(value_el) else {
            continue;
        };
        assign_labeled_value(&mut record, &label.to_ascii_lowercase(), value);
    }

    if record.description.is_none() {
        let desc = selector(".description, .program-description, .content p");
        if let Some(el) = document.select(&desc).next() {
            record.description = element_text(el);
        }
    }

    record
}

/// Keyword mapping from scraped row labels to canonical fields. Labels vary
/// page to page, so matching is substring-based, most specific first.
fn assign_labeled_value(record: &mut ProgramRecord, label: &str, value: String) {
    if label.contains("state") {
        record.scope = Some(value.to_ascii_uppercase());
    } else if label.contains("type") || label.contains("category") {
        record.program_type = Some(value);
    } else if label.contains("implement") || label.contains("admin") {
        record.implementing_sector = Some(value);
    } else if label.contains("eligible") {
        record.eligible_sectors = Some(value);
    } else if label.contains("technolog") {
        record.technologies = Some(value);
    } else if label.contains("amount") || label.contains("incentive") {
        record.incentive_amount = Some(value);
    } else if label.contains("date") {
        if label.contains("start") || label.contains("effective") {
            record.start_date = Some(value);
        } else if label.contains("end") || label.contains("expir") {
            record.end_date = Some(value);
        } else {
            record.date_enacted = Some(value);
        }
    } else if label.contains("description") || label.contains("summary") {
        record.description = Some(value);
    } else if label.contains("contact") {
        record.contact = Some(value);
    } else if label.contains("web") || label.contains("url") || label.contains("link") {
        record.website = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    const LISTING: &str = r#"
        <html><body>
          <ul>
            <li><a href="/system/program/detail/5664">NY-Sun Megawatt Block Program</a></li>
            <li><a href="https://programs.example.org/system/program/detail/281">Net Metering</a></li>
            <li><a href="/about">Not a program</a></li>
            <li><a href="/system/program/detail/9001">   </a></li>
          </ul>
        </body></html>
    "#;

    #[test]
    fn listing_parser_extracts_id_name_and_link() {
        let records = parse_listing_html(LISTING, "https://programs.example.org", "ny", ts());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].external_id, "5664");
        assert_eq!(
            records[0].name.as_deref(),
            Some("NY-Sun Megawatt Block Program")
        );
        assert_eq!(records[0].scope.as_deref(), Some("NY"));
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://programs.example.org/system/program/detail/5664")
        );
        assert_eq!(records[1].external_id, "281");
    }

    const DETAIL: &str = r#"
        <html><body>
          <h1>Solar Thermal Rebate</h1>
          <table>
            <tr><th>State</th><td>ct</td></tr>
            <tr><th>Program Type</th><td>State Rebate Program</td></tr>
            <tr><th>Incentive Amount</th><td>$500 per system</td></tr>
            <tr><th>Effective Date</th><td>2021-07-01</td></tr>
            <tr><th>Expiration Date</th><td>2027-06-30</td></tr>
            <tr><th>Eligible Sectors</th><td>Residential</td></tr>
            <tr><th>Technologies</th><td>Solar Thermal</td></tr>
            <tr><th>Website</th><td>https://energy.example.gov/rebate</td></tr>
          </table>
          <div class="description">Rebates for residential solar thermal systems.</div>
        </body></html>
    "#;

    #[test]
    fn detail_parser_maps_label_value_rows() {
        let record = parse_detail_html(DETAIL, "7310", "https://x/detail/7310", ts());
        assert_eq!(record.external_id, "7310");
        assert_eq!(record.name.as_deref(), Some("Solar Thermal Rebate"));
        assert_eq!(record.scope.as_deref(), Some("CT"));
        assert_eq!(record.program_type.as_deref(), Some("State Rebate Program"));
        assert_eq!(record.incentive_amount.as_deref(), Some("$500 per system"));
        assert_eq!(record.start_date.as_deref(), Some("2021-07-01"));
        assert_eq!(record.end_date.as_deref(), Some("2027-06-30"));
        assert_eq!(record.eligible_sectors.as_deref(), Some("Residential"));
        assert_eq!(record.technologies.as_deref(), Some("Solar Thermal"));
        assert_eq!(
            record.website.as_deref(),
            Some("https://energy.example.gov/rebate")
        );
        assert_eq!(
            record.description.as_deref(),
            Some("Rebates for residential solar thermal systems.")
        );
    }

    #[test]
    fn api_listing_accepts_wrapped_and_bare_shapes() {
        let bare = json!([{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]);
        assert_eq!(normalize_api_listing(&bare, Some("NY"), ts()).len(), 2);

        let wrapped = json!({"programs": [{"id": 3, "name": "C"}]});
        let records = normalize_api_listing(&wrapped, Some("NY"), ts());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "3");
        assert_eq!(records[0].scope.as_deref(), Some("NY"));

        let data = json!({"data": [{"id": 4}]});
        assert_eq!(normalize_api_listing(&data, None, ts()).len(), 1);

        let junk = json!("not a listing");
        assert!(normalize_api_listing(&junk, None, ts()).is_empty());
    }

    #[tokio::test]
    async fn pacing_enforces_the_minimum_interval() {
        let transport = Transport::new(ClientConfig {
            rate_limit: Duration::from_millis(40),
            ..ClientConfig::default()
        })
        .unwrap();

        let begin = Instant::now();
        transport.pace().await;
        transport.pace().await;
        transport.pace().await;
        assert!(begin.elapsed() >= Duration::from_millis(80));
    }
}
