use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapkeepError};

/// Lifecycle state shared by snapshots and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(SnapkeepError::InvalidInput(format!(
                "unknown status '{other}'"
            ))),
        }
    }

    /// Terminal states freeze the owning record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directory tree registered for backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub path: String,
    /// Glob patterns matched against file basenames during the walk.
    pub exclusions: Vec<String>,
    pub target_id: Option<i64>,
    pub schedule_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named backend configuration binding sources to a storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    /// Backend type tag; must be registered (`local`, `s3`, `sftp`).
    #[serde(rename = "type")]
    pub kind: String,
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one backup attempt against one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub source_id: i64,
    pub target_id: i64,
    pub status: RunStatus,
    pub file_count: i64,
    pub total_bytes: i64,
    /// Bytes written for chunks the target had never seen before.
    pub delta_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One file recorded for a snapshot in the metadata store, mirroring the
/// manifest entry persisted in the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub id: i64,
    pub snapshot_id: i64,
    pub path: String,
    pub size: i64,
    pub hash: String,
    pub chunks: Vec<String>,
    pub mod_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "backup" => Ok(JobKind::Backup),
            "restore" => Ok(JobKind::Restore),
            other => Err(SnapkeepError::InvalidInput(format!(
                "unknown job type '{other}'"
            ))),
        }
    }
}

/// Audit record tracking one backup (or, reserved, restore) invocation.
/// Jobs observe snapshots; they never own them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Cron,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Manual => "manual",
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Frequency::Manual),
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "cron" => Ok(Frequency::Cron),
            other => Err(SnapkeepError::InvalidInput(format!(
                "unknown frequency '{other}'"
            ))),
        }
    }
}

/// Per-source backup schedule. Dispatch is owned by the embedding
/// application; the core only persists these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub source_id: i64,
    pub frequency: Frequency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
