//! SQLite-backed metadata store for sources, targets, snapshots, jobs and
//! schedules.
//!
//! The pool is capped at a single connection so every write is serialized
//! through one open handle; readers share the same connection. Timestamps
//! are stored as RFC 3339 text, list- and map-valued columns as JSON text.

mod migrate;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, SnapkeepError};
use crate::manifest::ManifestFile;
use crate::model::{
    Frequency, Job, JobKind, RunStatus, Schedule, Snapshot, SnapshotFile, Source, Target,
};

pub struct MetaStore {
    pool: Pool<SqliteConnectionManager>,
}

impl MetaStore {
    /// Open (creating if necessary) the database at `path` and run
    /// migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Self::from_manager(SqliteConnectionManager::file(path))
    }

    /// Open a private in-memory database. The single pooled connection
    /// keeps it alive for the store's lifetime.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_manager(SqliteConnectionManager::memory())
    }

    fn from_manager(manager: SqliteConnectionManager) -> Result<Self> {
        let manager = manager.with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        let conn = store.conn()?;
        migrate::migrate(&conn)?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // ── sources ──

    pub fn insert_source(&self, source: &Source) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sources (name, path, exclusions, target_id, schedule_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source.name,
                source.path,
                serde_json::to_string(&source.exclusions)?,
                source.target_id,
                source.schedule_id,
                source.created_at.to_rfc3339(),
                source.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn source(&self, id: i64) -> Result<Source> {
        self.conn()?
            .query_row(
                "SELECT id, name, path, exclusions, target_id, schedule_id, created_at, updated_at
                 FROM sources WHERE id = ?1",
                params![id],
                row_to_source,
            )
            .optional()?
            .ok_or_else(|| SnapkeepError::NotFound(format!("source {id}")))
    }

    pub fn sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, path, exclusions, target_id, schedule_id, created_at, updated_at
             FROM sources ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_source)?;
        collect(rows)
    }

    pub fn update_source(&self, source: &Source) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE sources
             SET name = ?1, path = ?2, exclusions = ?3, target_id = ?4, schedule_id = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                source.name,
                source.path,
                serde_json::to_string(&source.exclusions)?,
                source.target_id,
                source.schedule_id,
                Utc::now().to_rfc3339(),
                source.id,
            ],
        )?;
        require_row(changed, || format!("source {}", source.id))
    }

    pub fn delete_source(&self, id: i64) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM sources WHERE id = ?1", params![id])?;
        require_row(changed, || format!("source {id}"))
    }

    // ── targets ──

    pub fn insert_target(&self, target: &Target) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, type, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.name,
                target.kind,
                serde_json::to_string(&target.config)?,
                target.created_at.to_rfc3339(),
                target.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn target(&self, id: i64) -> Result<Target> {
        self.conn()?
            .query_row(
                "SELECT id, name, type, config, created_at, updated_at FROM targets WHERE id = ?1",
                params![id],
                row_to_target,
            )
            .optional()?
            .ok_or_else(|| SnapkeepError::NotFound(format!("target {id}")))
    }

    pub fn targets(&self) -> Result<Vec<Target>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, type, config, created_at, updated_at FROM targets ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_target)?;
        collect(rows)
    }

    pub fn update_target(&self, target: &Target) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE targets SET name = ?1, type = ?2, config = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                target.name,
                target.kind,
                serde_json::to_string(&target.config)?,
                Utc::now().to_rfc3339(),
                target.id,
            ],
        )?;
        require_row(changed, || format!("target {}", target.id))
    }

    pub fn delete_target(&self, id: i64) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        require_row(changed, || format!("target {id}"))
    }

    // ── snapshots ──

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshots (source_id, target_id, status, file_count, total_bytes, delta_bytes, error, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot.source_id,
                snapshot.target_id,
                snapshot.status.as_str(),
                snapshot.file_count,
                snapshot.total_bytes,
                snapshot.delta_bytes,
                snapshot.error,
                snapshot.created_at.to_rfc3339(),
                snapshot.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn snapshot(&self, id: i64) -> Result<Snapshot> {
        self.conn()?
            .query_row(
                "SELECT id, source_id, target_id, status, file_count, total_bytes, delta_bytes, error, created_at, completed_at
                 FROM snapshots WHERE id = ?1",
                params![id],
                row_to_snapshot,
            )
            .optional()?
            .ok_or_else(|| SnapkeepError::NotFound(format!("snapshot {id}")))
    }

    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, status, file_count, total_bytes, delta_bytes, error, created_at, completed_at
             FROM snapshots ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        collect(rows)
    }

    pub fn snapshots_for_source(&self, source_id: i64) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, status, file_count, total_bytes, delta_bytes, error, created_at, completed_at
             FROM snapshots WHERE source_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![source_id], row_to_snapshot)?;
        collect(rows)
    }

    /// Transition a snapshot to a terminal (or running) state, stamping
    /// `completed_at` for terminal states.
    pub fn finish_snapshot(
        &self,
        id: i64,
        status: RunStatus,
        file_count: i64,
        total_bytes: i64,
        delta_bytes: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let changed = self.conn()?.execute(
            "UPDATE snapshots
             SET status = ?1, file_count = ?2, total_bytes = ?3, delta_bytes = ?4, error = ?5, completed_at = ?6
             WHERE id = ?7",
            params![
                status.as_str(),
                file_count,
                total_bytes,
                delta_bytes,
                error,
                completed_at,
                id,
            ],
        )?;
        require_row(changed, || format!("snapshot {id}"))
    }

    pub fn delete_snapshot(&self, id: i64) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        require_row(changed, || format!("snapshot {id}"))
    }

    // ── snapshot files ──

    /// Record a snapshot's manifest entries for querying without touching
    /// the backend.
    pub fn insert_snapshot_files(&self, snapshot_id: i64, files: &[ManifestFile]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_files (snapshot_id, path, size, hash, chunks, mod_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let now = Utc::now().to_rfc3339();
            for file in files {
                stmt.execute(params![
                    snapshot_id,
                    file.path,
                    file.size,
                    file.hash,
                    serde_json::to_string(&file.chunks)?,
                    file.mod_time.to_rfc3339(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn snapshot_files(&self, snapshot_id: i64) -> Result<Vec<SnapshotFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, snapshot_id, path, size, hash, chunks, mod_time, created_at
             FROM snapshot_files WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![snapshot_id], row_to_snapshot_file)?;
        collect(rows)
    }

    // ── jobs ──

    pub fn insert_job(&self, job: &Job) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (type, source_id, snapshot_id, status, error, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.kind.as_str(),
                job.source_id,
                job.snapshot_id,
                job.status.as_str(),
                job.error,
                job.started_at.to_rfc3339(),
                job.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn job(&self, id: i64) -> Result<Job> {
        self.conn()?
            .query_row(
                "SELECT id, type, source_id, snapshot_id, status, error, started_at, ended_at
                 FROM jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| SnapkeepError::NotFound(format!("job {id}")))
    }

    /// All jobs, newest first, capped at 100 entries.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, source_id, snapshot_id, status, error, started_at, ended_at
             FROM jobs ORDER BY started_at DESC, id DESC LIMIT 100",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        collect(rows)
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = ?1, snapshot_id = ?2, error = ?3, ended_at = ?4 WHERE id = ?5",
            params![
                job.status.as_str(),
                job.snapshot_id,
                job.error,
                job.ended_at.map(|t| t.to_rfc3339()),
                job.id,
            ],
        )?;
        require_row(changed, || format!("job {}", job.id))
    }

    // ── schedules ──

    pub fn insert_schedule(&self, schedule: &Schedule) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedules (source_id, frequency, cron_expr, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                schedule.source_id,
                schedule.frequency.as_str(),
                schedule.cron_expr,
                schedule.enabled,
                schedule.created_at.to_rfc3339(),
                schedule.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn schedule(&self, id: i64) -> Result<Schedule> {
        self.conn()?
            .query_row(
                "SELECT id, source_id, frequency, cron_expr, enabled, created_at, updated_at
                 FROM schedules WHERE id = ?1",
                params![id],
                row_to_schedule,
            )
            .optional()?
            .ok_or_else(|| SnapkeepError::NotFound(format!("schedule {id}")))
    }

    pub fn schedules_for_source(&self, source_id: i64) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, frequency, cron_expr, enabled, created_at, updated_at
             FROM schedules WHERE source_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_id], row_to_schedule)?;
        collect(rows)
    }

    pub fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE schedules SET frequency = ?1, cron_expr = ?2, enabled = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                schedule.frequency.as_str(),
                schedule.cron_expr,
                schedule.enabled,
                Utc::now().to_rfc3339(),
                schedule.id,
            ],
        )?;
        require_row(changed, || format!("schedule {}", schedule.id))
    }

    pub fn delete_schedule(&self, id: i64) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        require_row(changed, || format!("schedule {id}"))
    }
}

fn require_row(changed: usize, what: impl FnOnce() -> String) -> Result<()> {
    if changed == 0 {
        return Err(SnapkeepError::NotFound(what()));
    }
    Ok(())
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn conversion_err(
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn ts(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    raw.parse::<DateTime<Utc>>().map_err(conversion_err)
}

fn opt_ts(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| s.parse::<DateTime<Utc>>().map_err(conversion_err))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(conversion_err)
}

fn status_col(row: &Row, col: &str) -> rusqlite::Result<RunStatus> {
    let raw: String = row.get(col)?;
    RunStatus::parse(&raw).map_err(conversion_err)
}

fn row_to_source(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get("id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        exclusions: json_col(row, "exclusions")?,
        target_id: row.get("target_id")?,
        schedule_id: row.get("schedule_id")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn row_to_target(row: &Row) -> rusqlite::Result<Target> {
    Ok(Target {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: row.get("type")?,
        config: json_col::<HashMap<String, String>>(row, "config")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        status: status_col(row, "status")?,
        file_count: row.get("file_count")?,
        total_bytes: row.get("total_bytes")?,
        delta_bytes: row.get("delta_bytes")?,
        error: row.get("error")?,
        created_at: ts(row, "created_at")?,
        completed_at: opt_ts(row, "completed_at")?,
    })
}

fn row_to_snapshot_file(row: &Row) -> rusqlite::Result<SnapshotFile> {
    Ok(SnapshotFile {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        path: row.get("path")?,
        size: row.get("size")?,
        hash: row.get("hash")?,
        chunks: json_col(row, "chunks")?,
        mod_time: ts(row, "mod_time")?,
        created_at: ts(row, "created_at")?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let kind: String = row.get("type")?;
    Ok(Job {
        id: row.get("id")?,
        kind: JobKind::parse(&kind).map_err(conversion_err)?,
        source_id: row.get("source_id")?,
        snapshot_id: row.get("snapshot_id")?,
        status: status_col(row, "status")?,
        error: row.get("error")?,
        started_at: ts(row, "started_at")?,
        ended_at: opt_ts(row, "ended_at")?,
    })
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<Schedule> {
    let frequency: String = row.get("frequency")?;
    Ok(Schedule {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        frequency: Frequency::parse(&frequency).map_err(conversion_err)?,
        cron_expr: row.get("cron_expr")?,
        enabled: row.get("enabled")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}
