//! Job tracking for backup invocations.
//!
//! Jobs are an audit channel, not a control channel: engine correctness
//! never depends on them, and callers that fail to record a status change
//! log the failure instead of aborting the backup.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::error::Result;
use crate::model::{Job, JobKind, RunStatus};
use crate::store::MetaStore;

pub struct JobService {
    store: Arc<MetaStore>,
}

impl JobService {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    /// Create a pending backup job for a source.
    pub fn create_backup(&self, source_id: i64) -> Result<Job> {
        let mut job = Job {
            id: 0,
            kind: JobKind::Backup,
            source_id: Some(source_id),
            snapshot_id: None,
            status: RunStatus::Pending,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        job.id = self.store.insert_job(&job).inspect_err(|e| {
            error!(source_id, error = %e, "failed to create backup job");
        })?;
        info!(job_id = job.id, source_id, "backup job created");
        Ok(job)
    }

    /// Move a job to `status`, capturing an error message and stamping
    /// `ended_at` on terminal states.
    pub fn update_status(
        &self,
        job_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut job = self.store.job(job_id)?;
        job.status = status;
        if let Some(msg) = error {
            job.error = Some(msg.to_string());
        }
        if status.is_terminal() {
            job.ended_at = Some(Utc::now());
        }
        self.store.update_job(&job).inspect_err(|e| {
            error!(job_id, error = %e, "failed to update job");
        })?;
        info!(job_id, status = %status, "job status updated");
        Ok(())
    }

    /// Attach the snapshot a running job produced.
    pub fn attach_snapshot(&self, job_id: i64, snapshot_id: i64) -> Result<()> {
        let mut job = self.store.job(job_id)?;
        job.snapshot_id = Some(snapshot_id);
        self.store.update_job(&job)
    }

    pub fn job(&self, id: i64) -> Result<Job> {
        self.store.job(id)
    }

    /// All jobs, newest first, capped at 100.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        self.store.jobs()
    }
}
