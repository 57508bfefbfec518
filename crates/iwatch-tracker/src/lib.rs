//! Persistent change tracker: the single source of truth for "have we seen
//! this exact content before".
//!
//! One SQLite file holds four tables: `programs` (one row per distinct
//! external id ever seen), `program_snapshots` (append-only payload history),
//! `program_changes` (field-level diffs between consecutive snapshots) and
//! `scan_runs` (one row per scan invocation).

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use iwatch_core::{diff_tracked_maps, hash_attributes, ProgramRecord};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "iwatch-tracker";

pub type AttributeMap = BTreeMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("export i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
}

/// Outcome of one observation: at most one of the flags is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub is_new: bool,
    pub is_updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Scheduled,
    Manual,
    Full,
    Retry,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Scheduled => "scheduled",
            ScanType::Manual => "manual",
            ScanType::Full => "full",
            ScanType::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanCounts {
    pub total_found: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrackedProgram {
    pub id: i64,
    pub external_id: String,
    pub name: Option<String>,
    pub scope: Option<String>,
    pub program_type: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChangeRecord {
    pub id: i64,
    pub program_id: i64,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScanRun {
    pub id: i64,
    pub scan_type: String,
    pub scopes_json: Option<String>,
    pub total_found: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
}

impl ScanRun {
    pub fn scopes(&self) -> Vec<String> {
        self.scopes_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

/// A tracked program together with its most recent snapshot payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramDetail {
    pub program: TrackedProgram,
    pub payload: AttributeMap,
}

/// A changed program joined with its change events in the query window.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatedProgram {
    pub program: TrackedProgram,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeCount {
    pub scope: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub total_programs: i64,
    pub active_programs: i64,
    pub by_scope: Vec<ScopeCount>,
    pub new_last_24h: i64,
    pub new_last_7d: i64,
    pub total_changes: i64,
    pub last_scan: Option<ScanRun>,
}

#[derive(Debug, Serialize)]
struct ExportEnvelope {
    exported_at: DateTime<Utc>,
    total_count: usize,
    programs: Vec<TrackedProgram>,
}

const SCHEMA: [&str; 11] = [
    "CREATE TABLE IF NOT EXISTS programs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT UNIQUE NOT NULL,
        name TEXT,
        scope TEXT,
        program_type TEXT,
        first_seen_at TIMESTAMP NOT NULL,
        last_seen_at TIMESTAMP NOT NULL,
        last_updated_at TIMESTAMP,
        content_hash TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS program_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        program_id INTEGER NOT NULL REFERENCES programs(id),
        payload_json TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        captured_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS program_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        program_id INTEGER NOT NULL REFERENCES programs(id),
        field_name TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        detected_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scan_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_type TEXT NOT NULL,
        scopes_json TEXT,
        total_found INTEGER NOT NULL DEFAULT 0,
        new_count INTEGER NOT NULL DEFAULT 0,
        updated_count INTEGER NOT NULL DEFAULT 0,
        removed_count INTEGER NOT NULL DEFAULT 0,
        started_at TIMESTAMP NOT NULL,
        completed_at TIMESTAMP,
        status TEXT NOT NULL DEFAULT 'running',
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_programs_external_id ON programs(external_id)",
    "CREATE INDEX IF NOT EXISTS idx_programs_scope ON programs(scope)",
    "CREATE INDEX IF NOT EXISTS idx_programs_first_seen ON programs(first_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_program ON program_snapshots(program_id)",
    "CREATE INDEX IF NOT EXISTS idx_changes_program ON program_changes(program_id)",
    "CREATE INDEX IF NOT EXISTS idx_changes_detected ON program_changes(detected_at)",
    "CREATE INDEX IF NOT EXISTS idx_scan_runs_started ON scan_runs(started_at)",
];

#[derive(Debug, Clone)]
pub struct ChangeTracker {
    pool: SqlitePool,
}

impl ChangeTracker {
    /// Open (creating if missing) the tracker database at `path`. Any scan
    /// run left in `running` from a previous crash is closed as failed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let tracker = Self::connect(options).await?;
        info!(path = %path.display(), "tracker database opened");
        Ok(tracker)
    }

    /// In-process database, used by tests and ad-hoc tooling.
    pub async fn in_memory() -> Result<Self, TrackerError> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, TrackerError> {
        // Single connection: SQLite is a single-writer store and scans are
        // sequential; a wider pool would also break the in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let tracker = Self { pool };
        tracker.init_schema().await?;
        tracker.recover_stale_runs().await?;
        Ok(tracker)
    }

    async fn init_schema(&self) -> Result<(), TrackerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close scan runs orphaned in `running` by a previous crash. Without
    /// this a crashed daemon would leave rows that look like a live scan
    /// forever.
    async fn recover_stale_runs(&self) -> Result<u64, TrackerError> {
        let result = sqlx::query(
            "UPDATE scan_runs SET status = 'failed', completed_at = ?,
             error_message = 'interrupted (stale at startup)'
             WHERE status = 'running'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "closed stale running scan runs");
        }
        Ok(recovered)
    }

    /// Record one observation of a catalog entry.
    ///
    /// First sighting creates the program row plus its first snapshot and
    /// returns `is_new`. A re-observation refreshes `last_seen_at` and
    /// `is_active`; when the content hash differs it also writes one change
    /// event per differing tracked field (all sharing one `detected_at`),
    /// a new snapshot, and the new hash. All writes of one call commit or
    /// roll back together.
    pub async fn record_observation(
        &self,
        record: &ProgramRecord,
    ) -> Result<Observation, TrackerError> {
        let payload = record.attribute_map();
        let content_hash = hash_attributes(&payload);
        let payload_json = serde_json::to_string(&payload)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, content_hash FROM programs WHERE external_id = ?")
                .bind(&record.external_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((program_id, old_hash)) = existing else {
            let result = sqlx::query(
                "INSERT INTO programs (external_id, name, scope, program_type,
                 first_seen_at, last_seen_at, content_hash, is_active, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)",
            )
            .bind(&record.external_id)
            .bind(&record.name)
            .bind(&record.scope)
            .bind(&record.program_type)
            .bind(now)
            .bind(now)
            .bind(&content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            let program_id = result.last_insert_rowid();

            sqlx::query(
                "INSERT INTO program_snapshots (program_id, payload_json, content_hash, captured_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(program_id)
            .bind(&payload_json)
            .bind(&content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            info!(external_id = %record.external_id, "new program recorded");
            return Ok(Observation {
                is_new: true,
                is_updated: false,
            });
        };

        sqlx::query("UPDATE programs SET last_seen_at = ?, is_active = 1 WHERE id = ?")
            .bind(now)
            .bind(program_id)
            .execute(&mut *tx)
            .await?;

        if old_hash == content_hash {
            tx.commit().await?;
            return Ok(Observation {
                is_new: false,
                is_updated: false,
            });
        }

        let previous_payload: Option<(String,)> = sqlx::query_as(
            "SELECT payload_json FROM program_snapshots
             WHERE program_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(program_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((old_json,)) = previous_payload {
            let old_payload: AttributeMap = serde_json::from_str(&old_json)?;
            for change in diff_tracked_maps(&old_payload, &payload) {
                sqlx::query(
                    "INSERT INTO program_changes (program_id, field_name, old_value, new_value, detected_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(program_id)
                .bind(&change.field)
                .bind(&change.old_value)
                .bind(&change.new_value)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "INSERT INTO program_snapshots (program_id, payload_json, content_hash, captured_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(program_id)
        .bind(&payload_json)
        .bind(&content_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE programs SET content_hash = ?, last_updated_at = ? WHERE id = ?")
            .bind(&content_hash)
            .bind(now)
            .bind(program_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(external_id = %record.external_id, "program updated");
        Ok(Observation {
            is_new: false,
            is_updated: true,
        })
    }

    /// Flag programs that no longer appear upstream. History stays intact.
    pub async fn mark_inactive(&self, external_ids: &[String]) -> Result<u64, TrackerError> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; external_ids.len()].join(", ");
        let sql =
            format!("UPDATE programs SET is_active = 0 WHERE external_id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in external_ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        info!(count = result.rows_affected(), "programs marked inactive");
        Ok(result.rows_affected())
    }

    pub async fn start_scan(
        &self,
        scan_type: ScanType,
        scopes: &[String],
    ) -> Result<i64, TrackerError> {
        let scopes_json = if scopes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(scopes)?)
        };
        let result = sqlx::query(
            "INSERT INTO scan_runs (scan_type, scopes_json, started_at, status)
             VALUES (?, ?, ?, 'running')",
        )
        .bind(scan_type.as_str())
        .bind(scopes_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn end_scan(
        &self,
        scan_id: i64,
        status: ScanStatus,
        counts: ScanCounts,
        error_message: Option<&str>,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            "UPDATE scan_runs SET status = ?, completed_at = ?, total_found = ?,
             new_count = ?, updated_count = ?, removed_count = ?, error_message = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(counts.total_found)
        .bind(counts.new_count)
        .bind(counts.updated_count)
        .bind(counts.removed_count)
        .bind(error_message)
        .bind(scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Programs first seen at or after `since`, newest first, each with its
    /// latest snapshot payload.
    pub async fn new_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgramDetail>, TrackerError> {
        let programs: Vec<TrackedProgram> = sqlx::query_as(
            "SELECT * FROM programs WHERE first_seen_at >= ? ORDER BY first_seen_at DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut details = Vec::with_capacity(programs.len());
        for program in programs {
            let payload = self.latest_payload(program.id).await?;
            details.push(ProgramDetail { program, payload });
        }
        Ok(details)
    }

    pub async fn new_within_days(&self, days: i64) -> Result<Vec<ProgramDetail>, TrackerError> {
        self.new_since(Utc::now() - Duration::days(days)).await
    }

    /// Programs with change events detected at or after `since`, joined with
    /// those events.
    pub async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UpdatedProgram>, TrackerError> {
        let programs: Vec<TrackedProgram> = sqlx::query_as(
            "SELECT DISTINCT p.* FROM programs p
             JOIN program_changes c ON c.program_id = p.id
             WHERE c.detected_at >= ?
             ORDER BY p.last_updated_at DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut updated = Vec::with_capacity(programs.len());
        for program in programs {
            let changes: Vec<ChangeRecord> = sqlx::query_as(
                "SELECT * FROM program_changes
                 WHERE program_id = ? AND detected_at >= ?
                 ORDER BY detected_at DESC, id DESC",
            )
            .bind(program.id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            updated.push(UpdatedProgram { program, changes });
        }
        Ok(updated)
    }

    pub async fn updated_within_days(
        &self,
        days: i64,
    ) -> Result<Vec<UpdatedProgram>, TrackerError> {
        self.updated_since(Utc::now() - Duration::days(days)).await
    }

    pub async fn by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ProgramDetail>, TrackerError> {
        let program: Option<TrackedProgram> =
            sqlx::query_as("SELECT * FROM programs WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(program) = program else {
            return Ok(None);
        };
        let payload = self.latest_payload(program.id).await?;
        Ok(Some(ProgramDetail { program, payload }))
    }

    pub async fn all(
        &self,
        scope: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<TrackedProgram>, TrackerError> {
        let mut sql = String::from("SELECT * FROM programs WHERE 1 = 1");
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        if scope.is_some() {
            sql.push_str(" AND scope = ?");
        }
        sql.push_str(" ORDER BY first_seen_at DESC");

        let mut query = sqlx::query_as::<_, TrackedProgram>(&sql);
        if let Some(scope) = scope {
            query = query.bind(scope.to_ascii_uppercase());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Full change history for one program, newest first.
    pub async fn history(&self, external_id: &str) -> Result<Vec<ChangeRecord>, TrackerError> {
        Ok(sqlx::query_as(
            "SELECT c.* FROM program_changes c
             JOIN programs p ON p.id = c.program_id
             WHERE p.external_id = ?
             ORDER BY c.detected_at DESC, c.id DESC",
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn stats(&self) -> Result<TrackerStats, TrackerError> {
        let total_programs = self.count("SELECT COUNT(*) FROM programs", None).await?;
        let active_programs = self
            .count("SELECT COUNT(*) FROM programs WHERE is_active = 1", None)
            .await?;
        let total_changes = self.count("SELECT COUNT(*) FROM program_changes", None).await?;
        let new_last_24h = self
            .count(
                "SELECT COUNT(*) FROM programs WHERE first_seen_at >= ?",
                Some(Utc::now() - Duration::days(1)),
            )
            .await?;
        let new_last_7d = self
            .count(
                "SELECT COUNT(*) FROM programs WHERE first_seen_at >= ?",
                Some(Utc::now() - Duration::days(7)),
            )
            .await?;

        let by_scope: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT scope, COUNT(*) FROM programs WHERE is_active = 1
             GROUP BY scope ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_scope = by_scope
            .into_iter()
            .map(|(scope, count)| ScopeCount {
                scope: scope.unwrap_or_else(|| "(none)".to_string()),
                count,
            })
            .collect();

        let last_scan: Option<ScanRun> =
            sqlx::query_as("SELECT * FROM scan_runs ORDER BY started_at DESC, id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(TrackerStats {
            total_programs,
            active_programs,
            by_scope,
            new_last_24h,
            new_last_7d,
            total_changes,
            last_scan,
        })
    }

    pub async fn scan_history(&self, limit: i64) -> Result<Vec<ScanRun>, TrackerError> {
        Ok(sqlx::query_as(
            "SELECT * FROM scan_runs ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn export_to_json(
        &self,
        path: impl AsRef<Path>,
        active_only: bool,
    ) -> Result<usize, TrackerError> {
        let programs = self.all(None, active_only).await?;
        let envelope = ExportEnvelope {
            exported_at: Utc::now(),
            total_count: programs.len(),
            programs,
        };
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(&envelope)?)?;
        info!(path = %path.as_ref().display(), count = envelope.total_count, "json export written");
        Ok(envelope.total_count)
    }

    pub async fn export_to_csv(
        &self,
        path: impl AsRef<Path>,
        active_only: bool,
    ) -> Result<usize, TrackerError> {
        let programs = self.all(None, active_only).await?;
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record([
            "id",
            "external_id",
            "name",
            "scope",
            "program_type",
            "first_seen_at",
            "last_seen_at",
            "last_updated_at",
            "content_hash",
            "is_active",
            "created_at",
        ])?;
        for p in &programs {
            writer.write_record([
                p.id.to_string(),
                p.external_id.clone(),
                p.name.clone().unwrap_or_default(),
                p.scope.clone().unwrap_or_default(),
                p.program_type.clone().unwrap_or_default(),
                p.first_seen_at.to_rfc3339(),
                p.last_seen_at.to_rfc3339(),
                p.last_updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                p.content_hash.clone(),
                (p.is_active as i64).to_string(),
                p.created_at.to_rfc3339(),
            ])?;
        }
        writer.flush()?;
        info!(path = %path.as_ref().display(), count = programs.len(), "csv export written");
        Ok(programs.len())
    }

    async fn latest_payload(&self, program_id: i64) -> Result<AttributeMap, TrackerError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload_json FROM program_snapshots
             WHERE program_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(program_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(AttributeMap::new()),
        }
    }

    async fn count(
        &self,
        sql: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, TrackerError> {
        let mut query = sqlx::query_as::<_, (i64,)>(sql);
        if let Some(since) = since {
            query = query.bind(since);
        }
        Ok(query.fetch_one(&self.pool).await?.0)
    }
}
