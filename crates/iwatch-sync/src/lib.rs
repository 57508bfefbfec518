//! Scan orchestration: one-shot scan passes over a set of scopes, plus the
//! daily scheduler that rotates through scope groups and fires callbacks
//! when a pass finds something.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use iwatch_client::{CatalogSource, SCOPE_UNIVERSE};
use iwatch_core::ProgramRecord;
use iwatch_tracker::{
    ChangeTracker, Observation, ScanCounts, ScanRun, ScanStatus, ScanType, TrackerError,
    TrackerStats,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "iwatch-sync";

/// High-traffic jurisdictions included in every rotation day.
pub const PRIORITY_SCOPES: [&str; 8] = ["NY", "CA", "TX", "FL", "PA", "NJ", "MA", "CT"];

/// Regional rotation groups, one per weekday Monday through Saturday.
pub const ROTATION_GROUPS: [(&str, &[&str]); 6] = [
    ("northeast", &["CT", "ME", "MA", "NH", "RI", "VT", "NJ", "NY", "PA"]),
    ("southeast", &["DE", "FL", "GA", "MD", "NC", "SC", "VA", "DC", "WV"]),
    (
        "midwest",
        &["IL", "IN", "MI", "OH", "WI", "IA", "KS", "MN", "MO", "NE", "ND", "SD"],
    ),
    ("southwest", &["AZ", "NM", "OK", "TX"]),
    (
        "west",
        &["CO", "ID", "MT", "NV", "UT", "WY", "AK", "CA", "HI", "OR", "WA"],
    ),
    ("south", &["AL", "KY", "MS", "TN", "AR", "LA"]),
];

/// Scope list for a given calendar date: priority scopes plus the weekday's
/// rotation group, deduplicated. Sunday (and `scan_all`) covers the whole
/// universe, territories included.
pub fn scopes_for_date(date: NaiveDate, scan_all: bool) -> Vec<String> {
    if scan_all || date.weekday() == Weekday::Sun {
        return SCOPE_UNIVERSE.iter().map(|s| s.to_string()).collect();
    }
    let index = date.weekday().num_days_from_monday() as usize;
    let (group, members) = ROTATION_GROUPS[index];

    let mut scopes: Vec<String> = PRIORITY_SCOPES.iter().map(|s| s.to_string()).collect();
    for member in members {
        if !scopes.iter().any(|s| s == member) {
            scopes.push(member.to_string());
        }
    }
    debug!(group, count = scopes.len(), "rotation group selected");
    scopes
}

pub fn scopes_for_today(scan_all: bool) -> Vec<String> {
    scopes_for_date(Utc::now().date_naive(), scan_all)
}

/// One program mentioned in a scan report.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSighting {
    pub external_id: String,
    pub name: Option<String>,
    pub scope: Option<String>,
    pub program_type: Option<String>,
    pub seen_at: DateTime<Utc>,
}

impl ProgramSighting {
    fn from_record(record: &ProgramRecord) -> Self {
        Self {
            external_id: record.external_id.clone(),
            name: record.name.clone(),
            scope: record.scope.clone(),
            program_type: record.program_type.clone(),
            seen_at: record.fetched_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_id: i64,
    pub scan_type: String,
    pub scopes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_found: i64,
    pub new_programs: Vec<ProgramSighting>,
    pub updated_programs: Vec<ProgramSighting>,
    pub removed_count: i64,
    pub errors: Vec<String>,
}

impl ScanReport {
    pub fn new_count(&self) -> i64 {
        self.new_programs.len() as i64
    }

    pub fn updated_count(&self) -> i64 {
        self.updated_programs.len() as i64
    }

    pub fn has_findings(&self) -> bool {
        !self.new_programs.is_empty() || !self.updated_programs.is_empty()
    }

    fn counts(&self) -> ScanCounts {
        ScanCounts {
            total_found: self.total_found,
            new_count: self.new_count(),
            updated_count: self.updated_count(),
            removed_count: self.removed_count,
        }
    }
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(&str, usize, usize) + Send);

/// Persistence surface one scan pass writes through. `ChangeTracker` is the
/// production implementation; the seam lets tests inject storage failures.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn start_scan(
        &self,
        scan_type: ScanType,
        scopes: &[String],
    ) -> Result<i64, TrackerError>;

    async fn end_scan(
        &self,
        scan_id: i64,
        status: ScanStatus,
        counts: ScanCounts,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError>;

    async fn record_observation(
        &self,
        record: &ProgramRecord,
    ) -> Result<Observation, TrackerError>;

    async fn active_external_ids(&self) -> Result<Vec<String>, TrackerError>;

    async fn mark_inactive(&self, external_ids: &[String]) -> Result<u64, TrackerError>;
}

#[async_trait]
impl ScanStore for ChangeTracker {
    async fn start_scan(
        &self,
        scan_type: ScanType,
        scopes: &[String],
    ) -> Result<i64, TrackerError> {
        ChangeTracker::start_scan(self, scan_type, scopes).await
    }

    async fn end_scan(
        &self,
        scan_id: i64,
        status: ScanStatus,
        counts: ScanCounts,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError> {
        ChangeTracker::end_scan(self, scan_id, status, counts, error_message).await
    }

    async fn record_observation(
        &self,
        record: &ProgramRecord,
    ) -> Result<Observation, TrackerError> {
        ChangeTracker::record_observation(self, record).await
    }

    async fn active_external_ids(&self) -> Result<Vec<String>, TrackerError> {
        Ok(self
            .all(None, true)
            .await?
            .into_iter()
            .map(|p| p.external_id)
            .collect())
    }

    async fn mark_inactive(&self, external_ids: &[String]) -> Result<u64, TrackerError> {
        ChangeTracker::mark_inactive(self, external_ids).await
    }
}

/// Runs one scan pass at a time over a catalog source, recording every
/// observation in the tracker. A scope that fails to fetch is reported and
/// skipped; only tracker errors abort the pass.
pub struct ScanRunner {
    source: Arc<dyn CatalogSource>,
    tracker: ChangeTracker,
    store: Arc<dyn ScanStore>,
    // One pass at a time; SQLite has a single writer anyway.
    write_guard: Mutex<()>,
}

impl ScanRunner {
    pub fn new(source: Arc<dyn CatalogSource>, tracker: ChangeTracker) -> Self {
        let store: Arc<dyn ScanStore> = Arc::new(tracker.clone());
        Self {
            source,
            tracker,
            store,
            write_guard: Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn with_store(
        source: Arc<dyn CatalogSource>,
        tracker: ChangeTracker,
        store: Arc<dyn ScanStore>,
    ) -> Self {
        Self {
            source,
            tracker,
            store,
            write_guard: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub async fn run(
        &self,
        scan_type: ScanType,
        scopes: &[String],
        include_details: bool,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<ScanReport, TrackerError> {
        let _pass = self.write_guard.lock().await;

        let scopes: Vec<String> = scopes.iter().map(|s| s.to_ascii_uppercase()).collect();
        let scan_id = self.store.start_scan(scan_type, &scopes).await?;
        info!(
            scan_id,
            scan_type = scan_type.as_str(),
            scopes = scopes.len(),
            "scan started"
        );

        let mut report = ScanReport {
            scan_id,
            scan_type: scan_type.as_str().to_string(),
            scopes: scopes.clone(),
            started_at: Utc::now(),
            completed_at: None,
            total_found: 0,
            new_programs: Vec::new(),
            updated_programs: Vec::new(),
            removed_count: 0,
            errors: Vec::new(),
        };
        let mut seen = HashSet::new();

        self.scan_pass(&scopes, include_details, &mut progress, &mut report, &mut seen)
            .await;

        if let Err(err) = self.finish_scan(scan_type, scan_id, &mut report, &seen).await {
            error!(scan_id, %err, "scan failed");
            // Close the run before surfacing the error; if even this write
            // fails, stale-run recovery picks the row up on the next open.
            if let Err(close_err) = self
                .store
                .end_scan(
                    scan_id,
                    ScanStatus::Failed,
                    report.counts(),
                    Some(&err.to_string()),
                )
                .await
            {
                warn!(scan_id, %close_err, "failed scan run could not be closed");
            }
            return Err(err);
        }
        report.completed_at = Some(Utc::now());
        info!(
            scan_id,
            total = report.total_found,
            new = report.new_count(),
            updated = report.updated_count(),
            removed = report.removed_count,
            errors = report.errors.len(),
            "scan completed"
        );
        Ok(report)
    }

    async fn finish_scan(
        &self,
        scan_type: ScanType,
        scan_id: i64,
        report: &mut ScanReport,
        seen: &HashSet<String>,
    ) -> Result<(), TrackerError> {
        // Removal detection only makes sense when the whole universe was
        // covered and every scope answered; a failed scope would otherwise
        // deactivate programs we simply could not see.
        if scan_type == ScanType::Full && report.errors.is_empty() {
            report.removed_count = self.deactivate_missing(seen).await?;
        }
        self.store
            .end_scan(scan_id, ScanStatus::Completed, report.counts(), None)
            .await
    }

    async fn scan_pass(
        &self,
        scopes: &[String],
        include_details: bool,
        progress: &mut Option<ProgressFn<'_>>,
        report: &mut ScanReport,
        seen: &mut HashSet<String>,
    ) {
        for (index, scope) in scopes.iter().enumerate() {
            if let Some(cb) = progress.as_mut() {
                cb(scope, index + 1, scopes.len());
            }

            let records = match self.source.fetch_by_scope(scope).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(scope = %scope, %err, "scope fetch failed, skipping");
                    report.errors.push(format!("{scope}: {err}"));
                    continue;
                }
            };

            for mut record in records {
                if record.external_id.is_empty() {
                    continue;
                }
                if include_details {
                    match self.source.fetch_details(&record.external_id).await {
                        Ok(Some(detail)) => record = overlay_detail(record, detail),
                        Ok(None) => {}
                        Err(err) => {
                            warn!(external_id = %record.external_id, %err, "detail fetch failed")
                        }
                    }
                }

                seen.insert(record.external_id.clone());
                match self.store.record_observation(&record).await {
                    Ok(observation) => {
                        if observation.is_new {
                            report.new_programs.push(ProgramSighting::from_record(&record));
                        }
                        if observation.is_updated {
                            report
                                .updated_programs
                                .push(ProgramSighting::from_record(&record));
                        }
                        report.total_found += 1;
                    }
                    Err(err) => {
                        warn!(external_id = %record.external_id, %err, "observation not recorded");
                        report
                            .errors
                            .push(format!("{scope}/{}: {err}", record.external_id));
                    }
                }
            }
        }
    }

    async fn deactivate_missing(&self, seen: &HashSet<String>) -> Result<i64, TrackerError> {
        let active = self.store.active_external_ids().await?;
        let missing: Vec<String> = active
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        let removed = self.store.mark_inactive(&missing).await?;
        Ok(removed as i64)
    }
}

/// Listing rows carry a subset of the fields; the detail page fills in the
/// rest. Detail values win where both are present.
fn overlay_detail(base: ProgramRecord, detail: ProgramRecord) -> ProgramRecord {
    let mut merged = base;
    merged.scope = detail.scope.or(merged.scope);
    merged.name = detail.name.or(merged.name);
    merged.program_type = detail.program_type.or(merged.program_type);
    merged.implementing_sector = detail.implementing_sector.or(merged.implementing_sector);
    merged.eligible_sectors = detail.eligible_sectors.or(merged.eligible_sectors);
    merged.technologies = detail.technologies.or(merged.technologies);
    merged.incentive_amount = detail.incentive_amount.or(merged.incentive_amount);
    merged.start_date = detail.start_date.or(merged.start_date);
    merged.end_date = detail.end_date.or(merged.end_date);
    merged.date_enacted = detail.date_enacted.or(merged.date_enacted);
    merged.description = detail.description.or(merged.description);
    merged.contact = detail.contact.or(merged.contact);
    merged.website = detail.website.or(merged.website);
    merged.url = detail.url.or(merged.url);
    merged.extra.extend(detail.extra);
    merged.fetched_at = detail.fetched_at;
    merged
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub scan_time: NaiveTime,
    pub scan_all_scopes: bool,
    pub include_details: bool,
    pub max_retries: u32,
    pub retry_delay: std::time::Duration,
    pub webhook_url: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            scan_all_scopes: false,
            include_details: false,
            max_retries: 3,
            retry_delay: std::time::Duration::from_secs(300),
            webhook_url: None,
        }
    }
}

impl ScheduleConfig {
    /// Environment overrides on top of the defaults. Unparseable values fall
    /// back to the default rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("IWATCH_SCAN_TIME") {
            match NaiveTime::parse_from_str(&raw, "%H:%M") {
                Ok(time) => config.scan_time = time,
                Err(_) => warn!(%raw, "ignoring unparseable IWATCH_SCAN_TIME"),
            }
        }
        if let Ok(raw) = std::env::var("IWATCH_SCAN_ALL") {
            config.scan_all_scopes = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("IWATCH_INCLUDE_DETAILS") {
            config.include_details = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("IWATCH_MAX_RETRIES") {
            if let Ok(value) = raw.parse() {
                config.max_retries = value;
            }
        }
        if let Ok(raw) = std::env::var("IWATCH_RETRY_DELAY_SECS") {
            if let Ok(value) = raw.parse() {
                config.retry_delay = std::time::Duration::from_secs(value);
            }
        }
        if let Ok(url) = std::env::var("IWATCH_WEBHOOK_URL") {
            if !url.is_empty() {
                config.webhook_url = Some(url);
            }
        }
        config
    }
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub scan_time: String,
    pub todays_scopes: Vec<String>,
    pub last_scan: Option<ScanRun>,
    pub stats: TrackerStats,
}

type ReportCallback = Box<dyn Fn(&ScanReport) + Send + Sync>;

/// Daily scan scheduler. One cron job fires at the configured time, scans
/// the day's rotation, retries a bounded number of times on tracker failure,
/// and notifies callbacks plus an optional webhook when a pass found
/// anything.
pub struct Scheduler {
    runner: Arc<ScanRunner>,
    config: ScheduleConfig,
    callbacks: StdMutex<Vec<ReportCallback>>,
    http: reqwest::Client,
    jobs: Mutex<Option<JobScheduler>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(runner: Arc<ScanRunner>, config: ScheduleConfig) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            runner,
            config,
            callbacks: StdMutex::new(Vec::new()),
            http,
            jobs: Mutex::new(None),
            running: AtomicBool::new(false),
            stop_tx,
        }))
    }

    pub fn add_callback(&self, callback: impl Fn(&ScanReport) + Send + Sync + 'static) {
        // A panicked callback must not wedge the registry for everyone else.
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(callback));
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            warn!("scheduler already running");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;
        let expression = cron_expression(self.config.scan_time);
        let this = Arc::clone(self);
        scheduler
            .add(Job::new_async(expression.as_str(), move |_id, _lock| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.scheduled_pass().await;
                })
            })?)
            .await?;
        scheduler.start().await?;

        *jobs = Some(scheduler);
        self.running.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(false);
        info!(scan_time = %self.config.scan_time.format("%H:%M"), "scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(mut scheduler) = jobs.take() {
            scheduler.shutdown().await?;
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        info!("scheduler stopped");
        Ok(())
    }

    /// Blocks until `stop()` fires. Daemon mode parks on this.
    pub async fn wait(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        while !*stop_rx.borrow_and_update() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn scheduled_pass(&self) {
        let scopes = scopes_for_today(self.config.scan_all_scopes);
        match self
            .runner
            .run(ScanType::Scheduled, &scopes, self.config.include_details, None)
            .await
        {
            Ok(report) => self.notify(&report).await,
            Err(err) => {
                error!(%err, "scheduled scan failed");
                for attempt in 1..=self.config.max_retries {
                    info!(
                        attempt,
                        max = self.config.max_retries,
                        delay_secs = self.config.retry_delay.as_secs(),
                        "retrying scan"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    match self
                        .runner
                        .run(ScanType::Retry, &scopes, self.config.include_details, None)
                        .await
                    {
                        Ok(report) => {
                            self.notify(&report).await;
                            return;
                        }
                        Err(err) => error!(attempt, %err, "retry failed"),
                    }
                }
            }
        }
    }

    /// Immediate scan outside the schedule. Defaults to today's rotation.
    pub async fn run_now(
        &self,
        scopes: Option<Vec<String>>,
    ) -> Result<ScanReport, TrackerError> {
        let scopes = scopes.unwrap_or_else(|| scopes_for_today(self.config.scan_all_scopes));
        let report = self
            .runner
            .run(ScanType::Manual, &scopes, self.config.include_details, None)
            .await?;
        self.notify(&report).await;
        Ok(report)
    }

    pub async fn run_full_scan(&self) -> Result<ScanReport, TrackerError> {
        let scopes: Vec<String> = SCOPE_UNIVERSE.iter().map(|s| s.to_string()).collect();
        let report = self
            .runner
            .run(ScanType::Full, &scopes, self.config.include_details, None)
            .await?;
        self.notify(&report).await;
        Ok(report)
    }

    pub async fn status(&self) -> Result<SchedulerStatus, TrackerError> {
        let stats = self.runner.tracker().stats().await?;
        Ok(SchedulerStatus {
            running: self.is_running(),
            scan_time: self.config.scan_time.format("%H:%M").to_string(),
            todays_scopes: scopes_for_today(self.config.scan_all_scopes),
            last_scan: stats.last_scan.clone(),
            stats,
        })
    }

    async fn notify(&self, report: &ScanReport) {
        if !report.has_findings() {
            return;
        }

        {
            let callbacks = self
                .callbacks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for callback in callbacks.iter() {
                callback(report);
            }
        }

        if let Some(url) = &self.config.webhook_url {
            // Notification failure never fails the scan.
            match self.http.post(url).json(report).send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        warn!(status = %response.status(), "webhook returned an error status");
                    } else {
                        info!("webhook notification sent");
                    }
                }
                Err(err) => warn!(%err, "webhook notification failed"),
            }
        }
    }
}

fn cron_expression(time: NaiveTime) -> String {
    format!("0 {} {} * * *", time.minute(), time.hour())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use iwatch_client::FetchError;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn record(scope: &str, external_id: &str, name: &str, amount: &str) -> ProgramRecord {
        let mut r = ProgramRecord::new(external_id, Utc::now());
        r.scope = Some(scope.to_string());
        r.name = Some(name.to_string());
        r.incentive_amount = Some(amount.to_string());
        r
    }

    struct StubSource {
        listings: StdMutex<HashMap<String, Vec<ProgramRecord>>>,
        failing: Vec<String>,
        details: HashMap<String, ProgramRecord>,
    }

    impl StubSource {
        fn new(listings: HashMap<String, Vec<ProgramRecord>>) -> Self {
            Self {
                listings: StdMutex::new(listings),
                failing: Vec::new(),
                details: HashMap::new(),
            }
        }

        fn set_listing(&self, scope: &str, records: Vec<ProgramRecord>) {
            self.listings
                .lock()
                .unwrap()
                .insert(scope.to_string(), records);
        }
    }

    #[async_trait]
    impl CatalogSource for StubSource {
        async fn fetch_by_scope(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError> {
            if self.failing.iter().any(|s| s == scope) {
                return Err(FetchError::Parse {
                    url: format!("stub://{scope}"),
                    reason: "stub failure".to_string(),
                });
            }
            Ok(self
                .listings
                .lock()
                .unwrap()
                .get(scope)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_details(
            &self,
            external_id: &str,
        ) -> Result<Option<ProgramRecord>, FetchError> {
            Ok(self.details.get(external_id).cloned())
        }
    }

    async fn runner_with(source: StubSource) -> ScanRunner {
        let tracker = ChangeTracker::in_memory().await.unwrap();
        ScanRunner::new(Arc::new(source), tracker)
    }

    #[test]
    fn monday_rotation_is_priority_plus_northeast() {
        // 2026-03-02 is a Monday.
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let scopes = scopes_for_date(date, false);

        for priority in PRIORITY_SCOPES {
            assert!(scopes.iter().any(|s| s == priority), "missing {priority}");
        }
        assert!(scopes.iter().any(|s| s == "ME"));
        assert!(!scopes.iter().any(|s| s == "OH"));
        // 8 priority + 9 northeast with 5 overlapping.
        assert_eq!(scopes.len(), 12);
    }

    #[test]
    fn sunday_covers_the_full_universe() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(date.weekday(), Weekday::Sun);
        let scopes = scopes_for_date(date, false);
        assert_eq!(scopes.len(), SCOPE_UNIVERSE.len());
    }

    #[test]
    fn scan_all_overrides_the_rotation() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let scopes = scopes_for_date(date, true);
        assert_eq!(scopes.len(), SCOPE_UNIVERSE.len());
    }

    #[test]
    fn rotation_never_duplicates_and_stays_in_universe() {
        for offset in 0..7 {
            let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() + chrono::Duration::days(offset);
            let scopes = scopes_for_date(date, false);
            let unique: HashSet<&String> = scopes.iter().collect();
            assert_eq!(unique.len(), scopes.len(), "duplicates on {date}");
            for scope in &scopes {
                assert!(
                    SCOPE_UNIVERSE.contains(&scope.as_str()),
                    "unknown scope {scope} on {date}"
                );
            }
        }
    }

    #[test]
    fn cron_expression_places_time_fields() {
        let time = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        assert_eq!(cron_expression(time), "0 0 3 * * *");
        let time = NaiveTime::from_hms_opt(23, 45, 0).unwrap();
        assert_eq!(cron_expression(time), "0 45 23 * * *");
    }

    #[tokio::test]
    async fn failed_scope_is_skipped_not_fatal() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![
                record("NY", "NY-1", "Solar Rebate", "$500"),
                record("NY", "NY-2", "Wind Grant", "$900"),
            ],
        );
        let mut source = StubSource::new(listings);
        source.failing.push("CT".to_string());
        let runner = runner_with(source).await;

        let report = runner
            .run(
                ScanType::Manual,
                &["NY".to_string(), "CT".to_string()],
                false,
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.total_found, 2);
        assert_eq!(report.new_count(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("CT:"));
        assert!(report.completed_at.is_some());

        let runs = runner.tracker().scan_history(1).await.unwrap();
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].new_count, 2);
    }

    #[tokio::test]
    async fn consecutive_passes_classify_new_updated_unchanged() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![record("NY", "NY-1", "Solar Rebate", "$500")],
        );
        let source = Arc::new(StubSource::new(listings));
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = ScanRunner::new(Arc::clone(&source) as Arc<dyn CatalogSource>, tracker);
        let scopes = vec!["NY".to_string()];

        let first = runner.run(ScanType::Manual, &scopes, false, None).await.unwrap();
        assert_eq!(first.new_count(), 1);
        assert_eq!(first.updated_count(), 0);

        source.set_listing("NY", vec![record("NY", "NY-1", "Solar Rebate", "$750")]);
        let second = runner.run(ScanType::Manual, &scopes, false, None).await.unwrap();
        assert_eq!(second.new_count(), 0);
        assert_eq!(second.updated_count(), 1);

        let third = runner.run(ScanType::Manual, &scopes, false, None).await.unwrap();
        assert_eq!(third.new_count(), 0);
        assert_eq!(third.updated_count(), 0);

        let history = runner.tracker().history("NY-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field_name, "incentive_amount");
        assert_eq!(history[0].old_value.as_deref(), Some("$500"));
        assert_eq!(history[0].new_value.as_deref(), Some("$750"));
    }

    #[tokio::test]
    async fn full_scan_deactivates_programs_missing_upstream() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![
                record("NY", "NY-1", "Solar Rebate", "$500"),
                record("NY", "NY-2", "Wind Grant", "$900"),
            ],
        );
        let source = Arc::new(StubSource::new(listings));
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = ScanRunner::new(Arc::clone(&source) as Arc<dyn CatalogSource>, tracker);
        let scopes = vec!["NY".to_string()];

        runner.run(ScanType::Full, &scopes, false, None).await.unwrap();
        source.set_listing("NY", vec![record("NY", "NY-1", "Solar Rebate", "$500")]);
        let report = runner.run(ScanType::Full, &scopes, false, None).await.unwrap();

        assert_eq!(report.removed_count, 1);
        let active = runner.tracker().all(None, true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_id, "NY-1");
    }

    #[tokio::test]
    async fn full_scan_with_a_failed_scope_removes_nothing() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![record("NY", "NY-1", "Solar Rebate", "$500")],
        );
        let mut stub = StubSource::new(listings);
        stub.failing.push("CT".to_string());
        let source = Arc::new(stub);
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = ScanRunner::new(Arc::clone(&source) as Arc<dyn CatalogSource>, tracker);

        runner
            .run(ScanType::Full, &["NY".to_string()], false, None)
            .await
            .unwrap();
        source.set_listing("NY", Vec::new());
        let report = runner
            .run(
                ScanType::Full,
                &["NY".to_string(), "CT".to_string()],
                false,
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.removed_count, 0);
        assert_eq!(runner.tracker().all(None, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detail_fetch_enriches_the_stored_payload() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![record("NY", "NY-1", "Solar Rebate", "$500")],
        );
        let mut source = StubSource::new(listings);
        let mut detail = record("NY", "NY-1", "Solar Rebate", "$500");
        detail.description = Some("Residential rooftop rebate".to_string());
        source.details.insert("NY-1".to_string(), detail);
        let runner = runner_with(source).await;

        runner
            .run(ScanType::Manual, &["NY".to_string()], true, None)
            .await
            .unwrap();

        let stored = runner
            .tracker()
            .by_external_id("NY-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.payload.get("description"),
            Some(&serde_json::json!("Residential rooftop rebate"))
        );
    }

    #[tokio::test]
    async fn progress_callback_sees_every_scope() {
        let runner = runner_with(StubSource::new(HashMap::new())).await;
        let mut calls = Vec::new();
        let mut progress = |scope: &str, index: usize, total: usize| {
            calls.push((scope.to_string(), index, total));
        };

        runner
            .run(
                ScanType::Manual,
                &["ny".to_string(), "ct".to_string()],
                false,
                Some(&mut progress),
            )
            .await
            .unwrap();

        assert_eq!(
            calls,
            vec![("NY".to_string(), 1, 2), ("CT".to_string(), 2, 2)]
        );
    }

    #[tokio::test]
    async fn scheduler_notifies_callbacks_only_on_findings() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![record("NY", "NY-1", "Solar Rebate", "$500")],
        );
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = Arc::new(ScanRunner::new(
            Arc::new(StubSource::new(listings)) as Arc<dyn CatalogSource>,
            tracker,
        ));
        let scheduler = Scheduler::new(runner, ScheduleConfig::default()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.add_callback(move |report| {
            assert_eq!(report.new_count(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run_now(Some(vec!["NY".to_string()])).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unchanged pass: no findings, no callback.
        scheduler.run_now(Some(vec!["NY".to_string()])).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_returns_once_stop_fires() {
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = Arc::new(ScanRunner::new(
            Arc::new(StubSource::new(HashMap::new())) as Arc<dyn CatalogSource>,
            tracker,
        ));
        let scheduler = Scheduler::new(runner, ScheduleConfig::default()).unwrap();

        let waiter = Arc::clone(&scheduler);
        let parked = tokio::spawn(async move { waiter.wait().await });
        scheduler.stop().await.unwrap();
        parked.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn status_reports_rotation_and_stats() {
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = Arc::new(ScanRunner::new(
            Arc::new(StubSource::new(HashMap::new())) as Arc<dyn CatalogSource>,
            tracker,
        ));
        let scheduler = Scheduler::new(runner, ScheduleConfig::default()).unwrap();

        let status = scheduler.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.scan_time, "03:00");
        assert!(!status.todays_scopes.is_empty());
        assert_eq!(status.stats.total_programs, 0);
    }

    /// Delegates to a real tracker but can be told to reject the
    /// removal-detection write, so a pass fails after its run row exists.
    struct FlakyStore {
        inner: ChangeTracker,
        fail_mark_inactive: AtomicBool,
    }

    #[async_trait]
    impl ScanStore for FlakyStore {
        async fn start_scan(
            &self,
            scan_type: ScanType,
            scopes: &[String],
        ) -> Result<i64, TrackerError> {
            self.inner.start_scan(scan_type, scopes).await
        }

        async fn end_scan(
            &self,
            scan_id: i64,
            status: ScanStatus,
            counts: ScanCounts,
            error_message: Option<&str>,
        ) -> Result<(), TrackerError> {
            self.inner.end_scan(scan_id, status, counts, error_message).await
        }

        async fn record_observation(
            &self,
            record: &ProgramRecord,
        ) -> Result<Observation, TrackerError> {
            self.inner.record_observation(record).await
        }

        async fn active_external_ids(&self) -> Result<Vec<String>, TrackerError> {
            ScanStore::active_external_ids(&self.inner).await
        }

        async fn mark_inactive(&self, external_ids: &[String]) -> Result<u64, TrackerError> {
            if self.fail_mark_inactive.load(Ordering::SeqCst) {
                return Err(TrackerError::Io(std::io::Error::other("storage offline")));
            }
            self.inner.mark_inactive(external_ids).await
        }
    }

    #[tokio::test]
    async fn orchestration_failure_closes_the_run_as_failed() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![
                record("NY", "NY-1", "Solar Rebate", "$500"),
                record("NY", "NY-2", "Wind Grant", "$900"),
            ],
        );
        let source = Arc::new(StubSource::new(listings));
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let store = Arc::new(FlakyStore {
            inner: tracker.clone(),
            fail_mark_inactive: AtomicBool::new(false),
        });
        let runner = ScanRunner::with_store(
            Arc::clone(&source) as Arc<dyn CatalogSource>,
            tracker.clone(),
            Arc::clone(&store) as Arc<dyn ScanStore>,
        );
        let scopes = vec!["NY".to_string()];

        runner.run(ScanType::Full, &scopes, false, None).await.unwrap();

        store.fail_mark_inactive.store(true, Ordering::SeqCst);
        source.set_listing("NY", vec![record("NY", "NY-1", "Solar Rebate", "$500")]);
        let err = runner
            .run(ScanType::Full, &scopes, false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("storage offline"));

        // The run row is closed as failed with the error message, not left
        // dangling in the running state.
        let runs = tracker.scan_history(5).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, "failed");
        assert!(runs[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("storage offline"));
        assert!(runs[0].completed_at.is_some());

        // Removal detection never went through, so nothing was deactivated.
        assert_eq!(tracker.all(None, true).await.unwrap().len(), 2);
    }

    /// Records whether two fetches ever ran at the same time.
    struct SlowSource {
        active: AtomicUsize,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl CatalogSource for SlowSource {
        async fn fetch_by_scope(&self, scope: &str) -> Result<Vec<ProgramRecord>, FetchError> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![record(scope, &format!("{scope}-1"), "Solar Rebate", "$500")])
        }

        async fn fetch_details(&self, _: &str) -> Result<Option<ProgramRecord>, FetchError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn concurrent_runs_serialize_instead_of_interleaving() {
        let source = Arc::new(SlowSource {
            active: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        });
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = ScanRunner::new(Arc::clone(&source) as Arc<dyn CatalogSource>, tracker);

        let ny = ["NY".to_string()];
        let ct = ["CT".to_string()];
        let (first, second) = tokio::join!(
            runner.run(ScanType::Manual, &ny, false, None),
            runner.run(ScanType::Scheduled, &ct, false, None),
        );
        first.unwrap();
        second.unwrap();

        assert!(!source.overlapped.load(Ordering::SeqCst));
        let runs = runner.tracker().scan_history(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == "completed"));
    }

    #[tokio::test]
    async fn callback_registry_survives_poisoning() {
        let mut listings = HashMap::new();
        listings.insert(
            "NY".to_string(),
            vec![record("NY", "NY-1", "Solar Rebate", "$500")],
        );
        let tracker = ChangeTracker::in_memory().await.unwrap();
        let runner = Arc::new(ScanRunner::new(
            Arc::new(StubSource::new(listings)) as Arc<dyn CatalogSource>,
            tracker,
        ));
        let scheduler = Scheduler::new(runner, ScheduleConfig::default()).unwrap();

        let poisoner = Arc::clone(&scheduler);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.callbacks.lock().unwrap();
            panic!("poisoning the registry");
        })
        .join();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.add_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run_now(Some(vec!["NY".to_string()])).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
